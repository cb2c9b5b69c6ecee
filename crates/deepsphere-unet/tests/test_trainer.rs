//! End-to-end tests of [`deepsphere_unet::trainer::Trainer`] on a tiny
//! synthetic mesh (2 → 64 nodes) and deterministic synthetic samples.

use deepsphere_unet::config::TrainingConfig;
use deepsphere_unet::dataset::{ChannelStats, SyntheticConfig, SyntheticSphereDataset};
use deepsphere_unet::error::{DatasetError, TrainError};
use deepsphere_unet::graph::MeshHierarchy;
use deepsphere_unet::model::{SphericalUNet, UNetConfig};
use deepsphere_unet::trainer::{EpochRecord, StopReason, Trainer, CHECKPOINT_FILE};
use tch::{Device, Kind, Tensor};
use tempfile::TempDir;

fn config(dir: &TempDir) -> TrainingConfig {
    TrainingConfig {
        model: UNetConfig { pooling_factor: 2, ..UNetConfig::default() },
        partition: [0.5, 0.25, 0.25],
        batch_size: 2,
        n_epochs: 2,
        warmup_start_value: 1e-4,
        warmup_end_value: 1e-3,
        warmup_duration: 2,
        model_save_dir: dir.path().join("ckpt"),
        log_dir: dir.path().join("logs"),
        seed: 3,
        ..TrainingConfig::default()
    }
}

fn dataset() -> SyntheticSphereDataset {
    SyntheticSphereDataset::new(8, SyntheticConfig { num_nodes: 64, ..SyntheticConfig::default() })
}

fn hierarchy() -> MeshHierarchy {
    MeshHierarchy::synthetic(2, 2).unwrap()
}

#[test]
fn learning_rate_follows_warmup() {
    let dir = TempDir::new().unwrap();
    let trainer = Trainer::new(config(&dir));
    let model = trainer.build_model(&hierarchy()).unwrap();
    let summary = trainer.run(&model, &dataset()).unwrap();

    assert_eq!(summary.stop_reason, StopReason::Completed);
    assert_eq!(summary.epochs_run(), 2);
    assert!((summary.history[0].learning_rate - 1e-4).abs() < 1e-12);
    assert!((summary.history[1].learning_rate - 1e-3).abs() < 1e-12);
}

#[test]
fn history_file_matches_summary() {
    let dir = TempDir::new().unwrap();
    let trainer = Trainer::new(config(&dir));
    let model = trainer.build_model(&hierarchy()).unwrap();
    let summary = trainer.run(&model, &dataset()).unwrap();

    let json = std::fs::read_to_string(dir.path().join("logs/history.json")).unwrap();
    let history: Vec<EpochRecord> = serde_json::from_str(&json).unwrap();
    assert_eq!(history.len(), summary.epochs_run());
    for (a, b) in history.iter().zip(&summary.history) {
        assert_eq!(a.epoch, b.epoch);
        assert_eq!(a.validation.average_precision.len(), 3);
    }

    let saved = TrainingConfig::from_json(&dir.path().join("ckpt/config.json")).unwrap();
    assert_eq!(&saved, trainer.config());
}

#[test]
fn checkpoint_restores_trained_model() {
    let dir = TempDir::new().unwrap();
    let trainer = Trainer::new(config(&dir));
    let h = hierarchy();
    let model = trainer.build_model(&h).unwrap();
    let summary = trainer.run(&model, &dataset()).unwrap();
    assert_eq!(summary.checkpoint_path, dir.path().join("ckpt").join(CHECKPOINT_FILE));

    let restored =
        SphericalUNet::load(&summary.checkpoint_path, &h, &trainer.config().model, Device::Cpu)
            .unwrap();
    let x = Tensor::randn([1, 64, 16], (Kind::Float, Device::Cpu));
    let a = model.forward_inference(&x).unwrap();
    let b = restored.forward_inference(&x).unwrap();
    assert!(a.allclose(&b, 1e-5, 1e-6, false));
}

#[test]
fn provided_statistics_are_used_and_not_rewritten() {
    let dir = TempDir::new().unwrap();
    let stats_dir = dir.path().join("stats");
    let stats = ChannelStats { means: vec![0.0; 16], stds: vec![1.0; 16] };
    let (means, stds) = stats.write_npy(&stats_dir).unwrap();

    let cfg = TrainingConfig { means_path: Some(means), stds_path: Some(stds), ..config(&dir) };
    let trainer = Trainer::new(cfg);
    let model = trainer.build_model(&hierarchy()).unwrap();
    trainer.run(&model, &dataset()).unwrap();
    assert!(!dir.path().join("ckpt/means.npy").exists());
}

#[test]
fn statistics_must_cover_model_inputs() {
    let dir = TempDir::new().unwrap();
    let stats_dir = dir.path().join("stats");
    let stats = ChannelStats { means: vec![0.0; 8], stds: vec![1.0; 8] };
    let (means, stds) = stats.write_npy(&stats_dir).unwrap();

    let cfg = TrainingConfig { means_path: Some(means), stds_path: Some(stds), ..config(&dir) };
    let trainer = Trainer::new(cfg);
    let model = trainer.build_model(&hierarchy()).unwrap();
    let err = trainer.run(&model, &dataset()).unwrap_err();
    assert!(matches!(
        err,
        TrainError::Dataset(DatasetError::StatsChannels { stats: 8, channels: 16 })
    ));
}

#[test]
fn dataset_too_small_for_training_split() {
    let dir = TempDir::new().unwrap();
    let trainer = Trainer::new(config(&dir));
    let model = trainer.build_model(&hierarchy()).unwrap();
    let empty = SyntheticSphereDataset::new(0, SyntheticConfig { num_nodes: 64, ..SyntheticConfig::default() });
    let err = trainer.run(&model, &empty).unwrap_err();
    assert!(matches!(err, TrainError::EmptyDataset { split: "train" }));
}

#[test]
fn mismatched_sample_nodes_fail_the_run() {
    let dir = TempDir::new().unwrap();
    let trainer = Trainer::new(config(&dir));
    let model = trainer.build_model(&hierarchy()).unwrap();
    let wrong = SyntheticSphereDataset::new(8, SyntheticConfig { num_nodes: 32, ..SyntheticConfig::default() });
    let err = trainer.run(&model, &wrong).unwrap_err();
    assert!(matches!(err, TrainError::Model(ref e) if e.is_shape_mismatch()));
}
