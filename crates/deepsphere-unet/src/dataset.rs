//! Dataset abstractions and concrete implementations for Spherical U-Net
//! training.
//!
//! This module defines the [`SphereDataset`] trait plus two concrete
//! implementations:
//!
//! - [`NpyDirDataset`]: reads per-sample `.npy` pairs from a directory.
//! - [`SyntheticSphereDataset`]: generates fully-deterministic fields and
//!   labels; useful for unit tests, integration tests, and dry-run sanity
//!   checks. **Never uses random data.**
//!
//! [`Subset`] and [`Normalized`] adapt a dataset to one split with
//! per-channel normalization, and a [`DataLoader`] provides batched iteration
//! with a deterministic (seeded) shuffle. [`collate`] stacks a batch into
//! `[B, N, C]` / `[B, N, L]` tensors.
//!
//! # Directory layout expected by `NpyDirDataset`
//!
//! ```text
//! <root>/
//!   <id>_data.npy     # features [N, C]   float32
//!   <id>_labels.npy   # labels   [N, L]   float32 one-hot / multi-hot
//! ```
//!
//! # Example – synthetic dataset
//!
//! ```rust
//! use deepsphere_unet::dataset::{SphereDataset, SyntheticConfig, SyntheticSphereDataset};
//!
//! let ds = SyntheticSphereDataset::new(8, SyntheticConfig::default());
//!
//! assert_eq!(ds.len(), 8);
//! let sample = ds.get(0).unwrap();
//! assert_eq!(sample.features.shape(), &[3072, 16]);
//! assert_eq!(sample.labels.shape(), &[3072, 3]);
//! ```

use ndarray::{Array1, Array2, ArrayD, Axis, Ix2};
use ndarray_npy::{ReadNpyExt, WriteNpyExt};
use std::f32::consts::PI;
use std::path::{Path, PathBuf};
use tch::{Device, Tensor};
use tracing::{debug, info};

use crate::error::DatasetError;

// ---------------------------------------------------------------------------
// SphereSample
// ---------------------------------------------------------------------------

/// One spherical field snapshot with its per-node labels.
#[derive(Debug, Clone)]
pub struct SphereSample {
    /// Identifier used in logs and error messages.
    pub id: String,
    /// Features `[N, C]`.
    pub features: Array2<f32>,
    /// Labels `[N, L]`, one row per node.
    pub labels: Array2<f32>,
}

// ---------------------------------------------------------------------------
// SphereDataset trait
// ---------------------------------------------------------------------------

/// Common interface for all spherical segmentation datasets.
///
/// Implementations must be `Send + Sync` so they can be shared across
/// data-loading threads without additional synchronisation.
pub trait SphereDataset: Send + Sync {
    /// Total number of samples in this dataset.
    fn len(&self) -> usize;

    /// Load the sample at position `idx`.
    ///
    /// # Errors
    ///
    /// Returns [`DatasetError::IndexOutOfBounds`] when `idx >= self.len()` and
    /// dataset-specific errors for IO or format problems.
    fn get(&self, idx: usize) -> Result<SphereSample, DatasetError>;

    /// Returns `true` when the dataset contains no samples.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Human-readable name for logging.
    fn name(&self) -> &str;
}

fn check_index(idx: usize, len: usize) -> Result<(), DatasetError> {
    if idx >= len {
        return Err(DatasetError::IndexOutOfBounds { idx, len });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Subset / Normalized
// ---------------------------------------------------------------------------

/// View of selected indices of another dataset.
pub struct Subset<'a> {
    inner: &'a dyn SphereDataset,
    indices: Vec<usize>,
    name: String,
}

impl<'a> Subset<'a> {
    /// Select `indices` of `inner`; `split` names the view in logs.
    pub fn new(inner: &'a dyn SphereDataset, indices: Vec<usize>, split: &str) -> Self {
        let name = format!("{}[{split}]", inner.name());
        Subset { inner, indices, name }
    }
}

impl SphereDataset for Subset<'_> {
    fn len(&self) -> usize {
        self.indices.len()
    }

    fn get(&self, idx: usize) -> Result<SphereSample, DatasetError> {
        check_index(idx, self.indices.len())?;
        self.inner.get(self.indices[idx])
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Dataset whose features are normalized with [`ChannelStats`] on access.
pub struct Normalized<'a> {
    inner: &'a dyn SphereDataset,
    stats: &'a ChannelStats,
}

impl<'a> Normalized<'a> {
    /// Normalize every sample of `inner` with `stats`.
    pub fn new(inner: &'a dyn SphereDataset, stats: &'a ChannelStats) -> Self {
        Normalized { inner, stats }
    }
}

impl SphereDataset for Normalized<'_> {
    fn len(&self) -> usize {
        self.inner.len()
    }

    fn get(&self, idx: usize) -> Result<SphereSample, DatasetError> {
        let mut sample = self.inner.get(idx)?;
        self.stats.normalize(&mut sample.features)?;
        Ok(sample)
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

// ---------------------------------------------------------------------------
// Train / validation / test split
// ---------------------------------------------------------------------------

/// Split `0..n` into train / validation / test index sets.
///
/// Indices are shuffled with `seed` first; the train and validation shares
/// are `round(n · fraction)`, the test split takes the remainder.
pub fn split_indices(
    n: usize,
    partition: [f64; 3],
    seed: u64,
) -> (Vec<usize>, Vec<usize>, Vec<usize>) {
    let mut indices: Vec<usize> = (0..n).collect();
    xorshift_shuffle(&mut indices, seed);

    let n_train = ((n as f64 * partition[0]).round() as usize).min(n);
    let n_val = ((n as f64 * partition[1]).round() as usize).min(n - n_train);
    let test = indices.split_off(n_train + n_val);
    let val = indices.split_off(n_train);
    (indices, val, test)
}

// ---------------------------------------------------------------------------
// ChannelStats
// ---------------------------------------------------------------------------

/// Per-channel mean and standard deviation of the input features.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelStats {
    /// Mean of every channel.
    pub means: Vec<f32>,
    /// Population standard deviation of every channel.
    pub stds: Vec<f32>,
}

impl ChannelStats {
    /// Compute statistics over every node of every sample of `dataset`.
    ///
    /// # Errors
    ///
    /// Propagates sample loading errors; fails with
    /// [`DatasetError::SampleShape`] when samples disagree on the channel
    /// count.
    pub fn from_dataset(dataset: &dyn SphereDataset) -> Result<Self, DatasetError> {
        let mut sums: Vec<f64> = Vec::new();
        let mut squares: Vec<f64> = Vec::new();
        let mut count = 0usize;
        let mut expected: Option<[usize; 2]> = None;

        for idx in 0..dataset.len() {
            let sample = dataset.get(idx)?;
            let shape = [sample.features.nrows(), sample.features.ncols()];
            match expected {
                None => {
                    sums = vec![0.0; shape[1]];
                    squares = vec![0.0; shape[1]];
                    expected = Some(shape);
                }
                Some(e) if e[1] != shape[1] => {
                    return Err(DatasetError::SampleShape { id: sample.id, expected: e, actual: shape });
                }
                Some(_) => {}
            }
            for row in sample.features.rows() {
                for (c, &v) in row.iter().enumerate() {
                    sums[c] += f64::from(v);
                    squares[c] += f64::from(v) * f64::from(v);
                }
            }
            count += shape[0];
        }

        let n = count.max(1) as f64;
        let means: Vec<f32> = sums.iter().map(|s| (s / n) as f32).collect();
        let stds: Vec<f32> = sums
            .iter()
            .zip(&squares)
            .map(|(s, q)| {
                let mean = s / n;
                ((q / n - mean * mean).max(0.0)).sqrt() as f32
            })
            .collect();
        debug!(channels = means.len(), nodes = count, "computed channel statistics");
        Ok(ChannelStats { means, stds })
    }

    /// Number of channels covered.
    pub fn num_channels(&self) -> usize {
        self.means.len()
    }

    /// Apply `(x − mean) / std` column-wise in place.
    ///
    /// Channels whose standard deviation is (numerically) zero are only
    /// centred.
    pub fn normalize(&self, features: &mut Array2<f32>) -> Result<(), DatasetError> {
        if features.ncols() != self.means.len() || self.stds.len() != self.means.len() {
            return Err(DatasetError::StatsChannels {
                stats: self.means.len(),
                channels: features.ncols(),
            });
        }
        for ((mut col, &mean), &std) in
            features.axis_iter_mut(Axis(1)).zip(&self.means).zip(&self.stds)
        {
            let scale = if std > f32::EPSILON { std } else { 1.0 };
            col.mapv_inplace(|v| (v - mean) / scale);
        }
        Ok(())
    }

    /// Read statistics from two 1-D `.npy` files.
    pub fn from_npy(means_path: &Path, stds_path: &Path) -> Result<Self, DatasetError> {
        let means = load_npy_vec(means_path)?;
        let stds = load_npy_vec(stds_path)?;
        if means.len() != stds.len() {
            return Err(DatasetError::StatsChannels { stats: means.len(), channels: stds.len() });
        }
        Ok(ChannelStats { means, stds })
    }

    /// Write `means.npy` and `stds.npy` into `dir`; returns both paths.
    pub fn write_npy(&self, dir: &Path) -> Result<(PathBuf, PathBuf), DatasetError> {
        std::fs::create_dir_all(dir)?;
        let means_path = dir.join("means.npy");
        let stds_path = dir.join("stds.npy");
        write_npy_vec(&means_path, &self.means)?;
        write_npy_vec(&stds_path, &self.stds)?;
        Ok((means_path, stds_path))
    }
}

fn load_npy_vec(path: &Path) -> Result<Vec<f32>, DatasetError> {
    let file = std::fs::File::open(path)?;
    let arr = Array1::<f32>::read_npy(file).map_err(|e| DatasetError::npy_read(path, e.to_string()))?;
    Ok(arr.to_vec())
}

fn write_npy_vec(path: &Path, values: &[f32]) -> Result<(), DatasetError> {
    let file = std::fs::File::create(path)?;
    Array1::from(values.to_vec())
        .write_npy(file)
        .map_err(|e| DatasetError::npy_write(path, e.to_string()))
}

// ---------------------------------------------------------------------------
// DataLoader
// ---------------------------------------------------------------------------

/// Batched, optionally-shuffled iterator over a [`SphereDataset`].
///
/// The shuffle order is fully deterministic: given the same `seed`, epoch and
/// dataset length the iteration order is always identical. This ensures
/// reproducibility across training runs.
pub struct DataLoader<'a> {
    dataset: &'a dyn SphereDataset,
    batch_size: usize,
    shuffle: bool,
    seed: u64,
}

impl<'a> DataLoader<'a> {
    /// Create a new `DataLoader`.
    ///
    /// # Parameters
    ///
    /// - `dataset`    – the underlying dataset.
    /// - `batch_size` – number of samples per batch (clamped to at least 1).
    ///   The last batch may be smaller.
    /// - `shuffle`    – if `true`, samples are shuffled deterministically.
    /// - `seed`       – fixed seed for the shuffle RNG.
    pub fn new(dataset: &'a dyn SphereDataset, batch_size: usize, shuffle: bool, seed: u64) -> Self {
        DataLoader { dataset, batch_size: batch_size.max(1), shuffle, seed }
    }

    /// Number of complete (or partial) batches yielded per epoch.
    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    /// Iterate the first epoch.
    pub fn iter(&self) -> DataLoaderIter<'_> {
        self.epoch(0)
    }

    /// Iterate epoch `epoch`; each epoch has its own shuffle order.
    pub fn epoch(&self, epoch: usize) -> DataLoaderIter<'_> {
        let mut indices: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            let seed = self.seed ^ (epoch as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
            xorshift_shuffle(&mut indices, seed);
        }
        DataLoaderIter { dataset: self.dataset, indices, batch_size: self.batch_size, cursor: 0 }
    }
}

/// Iterator returned by [`DataLoader::iter`] and [`DataLoader::epoch`].
///
/// A sample that fails to load ends the batch with its error.
pub struct DataLoaderIter<'a> {
    dataset: &'a dyn SphereDataset,
    indices: Vec<usize>,
    batch_size: usize,
    cursor: usize,
}

impl Iterator for DataLoaderIter<'_> {
    type Item = Result<Vec<SphereSample>, DatasetError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.indices.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.indices.len());
        let batch_indices = &self.indices[self.cursor..end];
        self.cursor = end;
        Some(batch_indices.iter().map(|&idx| self.dataset.get(idx)).collect())
    }
}

/// Stack a batch into `(features [B, N, C], labels [B, N, L])` on `device`.
///
/// # Errors
///
/// [`DatasetError::Collate`] for an empty batch and
/// [`DatasetError::SampleShape`] when samples differ in shape.
pub fn collate(batch: &[SphereSample], device: Device) -> Result<(Tensor, Tensor), DatasetError> {
    let first = batch.first().ok_or_else(|| DatasetError::Collate("empty batch".into()))?;
    let (n, c) = first.features.dim();
    let l = first.labels.ncols();

    let mut features = Vec::with_capacity(batch.len() * n * c);
    let mut labels = Vec::with_capacity(batch.len() * n * l);
    for sample in batch {
        if sample.features.dim() != (n, c) {
            let (rn, rc) = sample.features.dim();
            return Err(DatasetError::SampleShape {
                id: sample.id.clone(),
                expected: [n, c],
                actual: [rn, rc],
            });
        }
        if sample.labels.dim() != (n, l) {
            let (rn, rl) = sample.labels.dim();
            return Err(DatasetError::SampleShape {
                id: sample.id.clone(),
                expected: [n, l],
                actual: [rn, rl],
            });
        }
        features.extend(sample.features.iter().copied());
        labels.extend(sample.labels.iter().copied());
    }

    let b = batch.len() as i64;
    let x = Tensor::from_slice(&features).reshape([b, n as i64, c as i64]).to_device(device);
    let y = Tensor::from_slice(&labels).reshape([b, n as i64, l as i64]).to_device(device);
    Ok((x, y))
}

// ---------------------------------------------------------------------------
// Xorshift shuffle (deterministic, no external RNG state)
// ---------------------------------------------------------------------------

/// In-place Fisher-Yates shuffle using a 64-bit Xorshift PRNG seeded with
/// `seed`. This is reproducible across platforms.
fn xorshift_shuffle(indices: &mut [usize], seed: u64) {
    let n = indices.len();
    if n <= 1 {
        return;
    }
    let mut state = if seed == 0 { 0x853c49e6748fea9b } else { seed };
    for i in (1..n).rev() {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        let j = (state as usize) % (i + 1);
        indices.swap(i, j);
    }
}

// ---------------------------------------------------------------------------
// NpyDirDataset
// ---------------------------------------------------------------------------

/// Samples stored as `<id>_data.npy` / `<id>_labels.npy` pairs.
#[derive(Debug, Clone)]
pub struct NpyDirDataset {
    root: PathBuf,
    ids: Vec<String>,
    name: String,
}

impl NpyDirDataset {
    /// Scan `root` for complete pairs, sorted by id. Data files without a
    /// label file are ignored.
    ///
    /// # Errors
    ///
    /// [`DatasetError::DirectoryNotFound`] when `root` is not a directory.
    pub fn discover(root: &Path) -> Result<Self, DatasetError> {
        if !root.is_dir() {
            return Err(DatasetError::DirectoryNotFound { path: root.to_path_buf() });
        }
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(root)? {
            let file_name = entry?.file_name();
            let Some(id) = file_name.to_str().and_then(|n| n.strip_suffix("_data.npy")) else {
                continue;
            };
            if root.join(format!("{id}_labels.npy")).is_file() {
                ids.push(id.to_string());
            } else {
                debug!(id, "skipping sample without labels");
            }
        }
        ids.sort();
        info!(root = %root.display(), samples = ids.len(), "discovered npy dataset");
        Ok(NpyDirDataset { root: root.to_path_buf(), ids, name: root.display().to_string() })
    }

    /// Sample identifiers in iteration order.
    pub fn ids(&self) -> &[String] {
        &self.ids
    }
}

impl SphereDataset for NpyDirDataset {
    fn len(&self) -> usize {
        self.ids.len()
    }

    fn get(&self, idx: usize) -> Result<SphereSample, DatasetError> {
        check_index(idx, self.ids.len())?;
        let id = &self.ids[idx];
        let features = load_npy_2d(&self.root.join(format!("{id}_data.npy")))?;
        let labels = load_npy_2d(&self.root.join(format!("{id}_labels.npy")))?;
        if labels.nrows() != features.nrows() {
            return Err(DatasetError::SampleShape {
                id: id.clone(),
                expected: [features.nrows(), labels.ncols()],
                actual: [labels.nrows(), labels.ncols()],
            });
        }
        Ok(SphereSample { id: id.clone(), features, labels })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Load a 2-D float32 NPY array.
fn load_npy_2d(path: &Path) -> Result<Array2<f32>, DatasetError> {
    let file = std::fs::File::open(path)?;
    let arr: ArrayD<f32> =
        ArrayD::read_npy(file).map_err(|e| DatasetError::npy_read(path, e.to_string()))?;
    let shape = arr.shape().to_vec();
    arr.into_dimensionality::<Ix2>().map_err(|e| {
        DatasetError::npy_read(path, format!("expected a 2-D array, got shape {shape:?}: {e}"))
    })
}

// ---------------------------------------------------------------------------
// SyntheticSphereDataset
// ---------------------------------------------------------------------------

/// Configuration for [`SyntheticSphereDataset`].
///
/// All fields are plain numbers; no randomness is involved.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticConfig {
    /// Nodes per sample. Default: **3072** (HEALPix `nside = 16`).
    pub num_nodes: usize,
    /// Feature channels. Default: **16**.
    pub num_channels: usize,
    /// Label channels (background first). Default: **3**.
    pub num_labels: usize,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        SyntheticConfig { num_nodes: 3072, num_channels: 16, num_labels: 3 }
    }
}

/// Deterministic travelling-wave fields with threshold labels.
///
/// Node `n` of sample `i` carries `s = sin(4π n / N + 0.37 i)`; channel `c`
/// holds `(c + 1) · s / 2 + c / 100`. The node is labelled 1 where
/// `s > 0.5`, 2 where `s < −0.5` (if there are at least 3 labels) and 0
/// otherwise.
#[derive(Debug, Clone)]
pub struct SyntheticSphereDataset {
    num_samples: usize,
    config: SyntheticConfig,
}

impl SyntheticSphereDataset {
    /// A dataset of `num_samples` samples.
    pub fn new(num_samples: usize, config: SyntheticConfig) -> Self {
        SyntheticSphereDataset { num_samples, config }
    }

    fn signal(&self, idx: usize, node: usize) -> f32 {
        let n = self.config.num_nodes.max(1) as f32;
        (4.0 * PI * node as f32 / n + 0.37 * idx as f32).sin()
    }

    fn label(&self, s: f32) -> usize {
        let class = if s > 0.5 {
            1
        } else if s < -0.5 {
            2
        } else {
            0
        };
        class.min(self.config.num_labels.saturating_sub(1))
    }
}

impl SphereDataset for SyntheticSphereDataset {
    fn len(&self) -> usize {
        self.num_samples
    }

    fn get(&self, idx: usize) -> Result<SphereSample, DatasetError> {
        check_index(idx, self.num_samples)?;
        let cfg = &self.config;
        let features = Array2::from_shape_fn((cfg.num_nodes, cfg.num_channels), |(node, c)| {
            (c as f32 + 1.0) * 0.5 * self.signal(idx, node) + c as f32 * 0.01
        });
        let mut labels = Array2::zeros((cfg.num_nodes, cfg.num_labels));
        if cfg.num_labels > 0 {
            for node in 0..cfg.num_nodes {
                labels[[node, self.label(self.signal(idx, node))]] = 1.0;
            }
        }
        Ok(SphereSample { id: format!("synthetic-{idx:05}"), features, labels })
    }

    fn name(&self) -> &str {
        "synthetic"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> SyntheticSphereDataset {
        SyntheticSphereDataset::new(
            10,
            SyntheticConfig { num_nodes: 32, num_channels: 4, num_labels: 3 },
        )
    }

    #[test]
    fn xorshift_shuffle_is_permutation() {
        let mut v: Vec<usize> = (0..50).collect();
        xorshift_shuffle(&mut v, 123);
        let mut sorted = v.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn xorshift_shuffle_is_deterministic() {
        let mut a: Vec<usize> = (0..20).collect();
        let mut b = a.clone();
        xorshift_shuffle(&mut a, 7);
        xorshift_shuffle(&mut b, 7);
        assert_eq!(a, b);
    }

    #[test]
    fn synthetic_labels_are_one_hot() {
        let ds = small();
        let sample = ds.get(3).unwrap();
        for row in sample.labels.rows() {
            assert_eq!(row.sum(), 1.0);
        }
        assert!(ds.get(10).is_err());
    }

    #[test]
    fn synthetic_dataset_is_deterministic() {
        let ds = small();
        assert_eq!(ds.get(4).unwrap().features, ds.get(4).unwrap().features);
    }

    #[test]
    fn split_covers_every_index_once() {
        let (train, val, test) = split_indices(10, [0.7, 0.2, 0.1], 1);
        assert_eq!((train.len(), val.len(), test.len()), (7, 2, 1));
        let mut all: Vec<usize> = train.iter().chain(&val).chain(&test).copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn normalized_features_have_zero_mean_unit_std() {
        let ds = small();
        let stats = ChannelStats::from_dataset(&ds).unwrap();
        let normalized = Normalized::new(&ds, &stats);
        let after = ChannelStats::from_dataset(&normalized).unwrap();
        for (m, s) in after.means.iter().zip(&after.stds) {
            assert!(m.abs() < 1e-4, "mean {m}");
            assert!((s - 1.0).abs() < 1e-3, "std {s}");
        }
    }

    #[test]
    fn constant_channel_is_only_centred() {
        let stats = ChannelStats { means: vec![2.0], stds: vec![0.0] };
        let mut x = Array2::from_elem((3, 1), 2.0_f32);
        stats.normalize(&mut x).unwrap();
        assert!(x.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn loader_batches_and_collates() {
        let ds = small();
        let loader = DataLoader::new(&ds, 4, true, 9);
        assert_eq!(loader.num_batches(), 3);
        let batches: Vec<_> = loader.epoch(1).collect::<Result<_, _>>().unwrap();
        assert_eq!(batches.iter().map(Vec::len).collect::<Vec<_>>(), vec![4, 4, 2]);
        let (x, y) = collate(&batches[0], Device::Cpu).unwrap();
        assert_eq!(x.size(), vec![4, 32, 4]);
        assert_eq!(y.size(), vec![4, 32, 3]);
    }

    #[test]
    fn collate_rejects_empty_batch() {
        assert!(matches!(collate(&[], Device::Cpu), Err(DatasetError::Collate(_))));
    }
}
