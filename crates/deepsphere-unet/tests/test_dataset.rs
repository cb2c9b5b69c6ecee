//! Integration tests for [`deepsphere_unet::dataset`].
//!
//! `.npy` fixtures are written to temporary directories from fixed arrays;
//! no random data is involved.

use std::path::Path;

use deepsphere_unet::dataset::{
    collate, split_indices, ChannelStats, DataLoader, Normalized, NpyDirDataset, SphereDataset,
    Subset, SyntheticConfig, SyntheticSphereDataset,
};
use deepsphere_unet::error::DatasetError;
use ndarray::{array, Array2};
use ndarray_npy::WriteNpyExt;
use tch::Device;
use tempfile::TempDir;

fn write_npy(path: &Path, arr: &Array2<f32>) {
    let file = std::fs::File::create(path).unwrap();
    arr.write_npy(file).unwrap();
}

fn write_pair(dir: &Path, id: &str, features: &Array2<f32>, labels: &Array2<f32>) {
    write_npy(&dir.join(format!("{id}_data.npy")), features);
    write_npy(&dir.join(format!("{id}_labels.npy")), labels);
}

// ---------------------------------------------------------------------------
// NpyDirDataset
// ---------------------------------------------------------------------------

#[test]
fn npy_directory_is_discovered_in_id_order() {
    let dir = TempDir::new().unwrap();
    let features = array![[1.0_f32, 2.0], [3.0, 4.0], [5.0, 6.0]];
    let labels = array![[1.0_f32, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
    write_pair(dir.path(), "b", &features, &labels);
    write_pair(dir.path(), "a", &(&features * 2.0), &labels);
    // data without labels is skipped
    write_npy(&dir.path().join("c_data.npy"), &features);

    let ds = NpyDirDataset::discover(dir.path()).unwrap();
    assert_eq!(ds.ids(), &["a".to_string(), "b".to_string()]);
    assert_eq!(ds.len(), 2);

    let a = ds.get(0).unwrap();
    assert_eq!(a.id, "a");
    assert_eq!(a.features[[2, 1]], 12.0);
    assert_eq!(a.labels, labels);
    assert!(matches!(ds.get(2), Err(DatasetError::IndexOutOfBounds { idx: 2, len: 2 })));
}

#[test]
fn missing_directory_is_reported() {
    let dir = TempDir::new().unwrap();
    let err = NpyDirDataset::discover(&dir.path().join("absent")).unwrap_err();
    assert!(matches!(err, DatasetError::DirectoryNotFound { .. }));
}

#[test]
fn label_rows_must_match_feature_rows() {
    let dir = TempDir::new().unwrap();
    write_pair(
        dir.path(),
        "bad",
        &array![[1.0_f32], [2.0], [3.0]],
        &array![[1.0_f32, 0.0], [0.0, 1.0]],
    );
    let ds = NpyDirDataset::discover(dir.path()).unwrap();
    let err = ds.get(0).unwrap_err();
    assert!(matches!(err, DatasetError::SampleShape { actual: [2, 2], .. }));
}

#[test]
fn corrupt_npy_is_a_read_error() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("x_data.npy"), b"not numpy").unwrap();
    std::fs::write(dir.path().join("x_labels.npy"), b"not numpy").unwrap();
    let ds = NpyDirDataset::discover(dir.path()).unwrap();
    assert!(matches!(ds.get(0), Err(DatasetError::NpyReadError { .. })));
}

// ---------------------------------------------------------------------------
// Statistics and normalization
// ---------------------------------------------------------------------------

#[test]
fn channel_stats_survive_npy_round_trip() {
    let dir = TempDir::new().unwrap();
    let stats = ChannelStats { means: vec![0.5, -1.0, 3.0], stds: vec![1.0, 2.0, 0.25] };
    let (means, stds) = stats.write_npy(dir.path()).unwrap();
    assert_eq!(means.file_name().unwrap(), "means.npy");
    assert_eq!(stds.file_name().unwrap(), "stds.npy");
    assert_eq!(ChannelStats::from_npy(&means, &stds).unwrap(), stats);
}

#[test]
fn stats_of_known_samples() {
    let dir = TempDir::new().unwrap();
    let labels = array![[1.0_f32], [1.0]];
    write_pair(dir.path(), "0", &array![[0.0_f32, 10.0], [2.0, 10.0]], &labels);
    write_pair(dir.path(), "1", &array![[4.0_f32, 10.0], [6.0, 10.0]], &labels);
    let ds = NpyDirDataset::discover(dir.path()).unwrap();

    let stats = ChannelStats::from_dataset(&ds).unwrap();
    assert_eq!(stats.means, vec![3.0, 10.0]);
    assert!((stats.stds[0] - 5.0_f32.sqrt()).abs() < 1e-6);
    assert_eq!(stats.stds[1], 0.0);

    let normalized = Normalized::new(&ds, &stats);
    let sample = normalized.get(1).unwrap();
    assert!((sample.features[[1, 0]] - 3.0 / 5.0_f32.sqrt()).abs() < 1e-6);
    assert_eq!(sample.features[[1, 1]], 0.0);
}

#[test]
fn stats_with_wrong_channel_count_are_rejected() {
    let ds = SyntheticSphereDataset::new(
        2,
        SyntheticConfig { num_nodes: 8, num_channels: 4, num_labels: 3 },
    );
    let stats = ChannelStats { means: vec![0.0; 3], stds: vec![1.0; 3] };
    let err = Normalized::new(&ds, &stats).get(0).unwrap_err();
    assert!(matches!(err, DatasetError::StatsChannels { stats: 3, channels: 4 }));
}

// ---------------------------------------------------------------------------
// Splits and loading
// ---------------------------------------------------------------------------

#[test]
fn split_sizes_follow_partition() {
    let (train, val, test) = split_indices(10, [0.7, 0.2, 0.1], 42);
    assert_eq!((train.len(), val.len(), test.len()), (7, 2, 1));

    let again = split_indices(10, [0.7, 0.2, 0.1], 42);
    assert_eq!(again, (train, val, test));
}

#[test]
fn loader_over_subset_collates_full_batches() {
    let cfg = SyntheticConfig { num_nodes: 16, num_channels: 4, num_labels: 3 };
    let ds = SyntheticSphereDataset::new(10, cfg);
    let subset = Subset::new(&ds, vec![1, 3, 5, 7, 9], "odd");
    assert_eq!(subset.name(), "synthetic[odd]");

    let loader = DataLoader::new(&subset, 2, true, 3);
    assert_eq!(loader.num_batches(), 3);

    let mut seen = 0;
    for batch in loader.epoch(4) {
        let batch = batch.unwrap();
        let (x, y) = collate(&batch, Device::Cpu).unwrap();
        assert_eq!(x.size(), vec![batch.len() as i64, 16, 4]);
        assert_eq!(y.size(), vec![batch.len() as i64, 16, 3]);
        seen += batch.len();
    }
    assert_eq!(seen, 5);
}

#[test]
fn shuffle_order_changes_between_epochs_but_not_between_runs() {
    let cfg = SyntheticConfig { num_nodes: 4, num_channels: 1, num_labels: 2 };
    let ds = SyntheticSphereDataset::new(16, cfg);
    let loader = DataLoader::new(&ds, 16, true, 11);
    let order = |epoch: usize| -> Vec<String> {
        loader
            .epoch(epoch)
            .flat_map(|b| b.unwrap())
            .map(|s| s.id)
            .collect()
    };
    assert_eq!(order(0), order(0));
    assert_ne!(order(0), order(1));
}

#[test]
fn ragged_batch_cannot_be_collated() {
    let small = SyntheticSphereDataset::new(1, SyntheticConfig { num_nodes: 8, ..SyntheticConfig::default() });
    let large = SyntheticSphereDataset::new(1, SyntheticConfig { num_nodes: 12, ..SyntheticConfig::default() });
    let batch = vec![small.get(0).unwrap(), large.get(0).unwrap()];
    let err = collate(&batch, Device::Cpu).unwrap_err();
    assert!(matches!(err, DatasetError::SampleShape { expected: [8, 16], actual: [12, 16], .. }));
}
