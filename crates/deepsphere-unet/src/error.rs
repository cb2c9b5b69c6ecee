//! Error types for the Spherical U-Net crate.
//!
//! This module is the single source of truth for all error types in the
//! crate. Every module that produces an error imports its error type from
//! here rather than defining it inline, keeping the hierarchy centralised.
//!
//! ## Hierarchy
//!
//! ```text
//! TrainError (top-level)
//! ├── ConfigError   (config validation / file loading)
//! ├── ModelError    (architecture construction + forward-pass shapes)
//! ├── DatasetError  (data loading, I/O, format)
//! └── TchError      (optimizer construction, checkpoint I/O)
//! ```
//!
//! [`ModelError`] splits into two families: structural misconfiguration
//! detected while building the network ([`ModelError::is_configuration`])
//! and per-call input shape problems ([`ModelError::is_shape_mismatch`]).
//! Neither is recoverable locally, so both are returned immediately.

use std::path::PathBuf;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Result aliases
// ---------------------------------------------------------------------------

/// Convenient `Result` alias used by orchestration-level functions.
pub type TrainResult<T> = Result<T, TrainError>;

/// `Result` alias for model construction and forward passes.
pub type ModelResult<T> = Result<T, ModelError>;

// ---------------------------------------------------------------------------
// TrainError: top-level aggregator
// ---------------------------------------------------------------------------

/// Top-level error type for the training pipeline.
///
/// Lower-level functions return their module-specific error type which is
/// coerced into `TrainError` via [`From`].
#[derive(Debug, Error)]
pub enum TrainError {
    /// A configuration validation or loading error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The network could not be built or rejected its input.
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    /// A dataset loading or access error.
    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Error raised by libtorch (optimizer creation, VarStore save/load).
    #[error("Torch error: {0}")]
    Tch(#[from] tch::TchError),

    /// The dataset (or one of its splits) is empty.
    #[error("Dataset split `{split}` is empty")]
    EmptyDataset {
        /// Name of the empty split.
        split: &'static str,
    },

    /// A checkpoint could not be saved or loaded.
    #[error("Checkpoint error: {message} (path: {path:?})")]
    Checkpoint {
        /// Human-readable description.
        message: String,
        /// Path that was being accessed.
        path: PathBuf,
    },
}

impl TrainError {
    /// Construct a [`TrainError::Checkpoint`].
    pub fn checkpoint<S: Into<String>>(msg: S, path: impl Into<PathBuf>) -> Self {
        TrainError::Checkpoint { message: msg.into(), path: path.into() }
    }
}

// ---------------------------------------------------------------------------
// ModelError
// ---------------------------------------------------------------------------

/// Errors produced while building the network or running a forward pass.
#[derive(Debug, Error)]
pub enum ModelError {
    /// The Laplacian normalization is neither `normalized` nor `combinatorial`.
    #[error("Invalid laplacian type `{value}`: expected `normalized` or `combinatorial`")]
    InvalidLaplacianType {
        /// The rejected value.
        value: String,
    },

    /// A per-level descriptor list does not contain exactly six entries.
    #[error("Expected exactly {expected} mesh levels in `{list}`, got {found}")]
    LevelCount {
        /// Which list was malformed (e.g. `edge_index_list`).
        list: &'static str,
        /// Required number of levels.
        expected: usize,
        /// Number of levels supplied.
        found: usize,
    },

    /// The Chebyshev kernel size must be at least one.
    #[error("Invalid kernel size {kernel_size}: must be >= 1")]
    InvalidKernelSize {
        /// The rejected kernel size.
        kernel_size: usize,
    },

    /// The decoder must produce at least one label channel.
    #[error("Invalid number of output labels {out_channels}: must be >= 1")]
    InvalidOutputChannels {
        /// The rejected label count.
        out_channels: i64,
    },

    /// The temporal sequence length must be at least one.
    #[error("Invalid sequence length {sequence_length}: must be >= 1")]
    InvalidSequenceLength {
        /// The rejected sequence length.
        sequence_length: usize,
    },

    /// A defect in the graph of one mesh level.
    #[error("Mesh level {level}: {source}")]
    Level {
        /// Offending level.
        level: usize,
        /// The defect found in that level's graph.
        #[source]
        source: Box<ModelError>,
    },

    /// A graph has no nodes.
    #[error("graph has no nodes")]
    EmptyGraph,

    /// An edge refers to a node outside the graph.
    #[error("edge {edge} references node {node} but the graph has {num_nodes} nodes")]
    NodeIndexOutOfRange {
        /// Position of the edge in the edge list.
        edge: usize,
        /// The out-of-range node index.
        node: i64,
        /// Node count of the graph.
        num_nodes: usize,
    },

    /// The source and target halves of an edge list differ in length.
    #[error("edge_index has {sources} sources but {targets} targets")]
    EdgeIndexShape {
        /// Number of source indices.
        sources: usize,
        /// Number of target indices.
        targets: usize,
    },

    /// The edge-weight vector does not have one entry per edge.
    #[error("{weights} edge weights supplied for {edges} edges")]
    EdgeWeightCount {
        /// Number of edges.
        edges: usize,
        /// Number of weights.
        weights: usize,
    },

    /// An edge weight is NaN or infinite.
    #[error("edge weight {edge} is not finite")]
    NonFiniteEdgeWeight {
        /// Position of the edge.
        edge: usize,
    },

    /// Node counts do not strictly decrease from level 5 to level 0.
    #[error("Mesh level {level} has {nodes} nodes, not fewer than the {finer_nodes} nodes of level {finer}")]
    NodeCountOrder {
        /// Coarser level.
        level: usize,
        /// Node count of the coarser level.
        nodes: usize,
        /// Finer level.
        finer: usize,
        /// Node count of the finer level.
        finer_nodes: usize,
    },

    /// The pooling operator cannot map one level onto the next.
    #[error("Pooling by factor {factor} cannot map {finer_nodes} nodes onto the {nodes} nodes of level {level}")]
    PoolingIncompatible {
        /// Coarser level.
        level: usize,
        /// Node count of the coarser level.
        nodes: usize,
        /// Node count of the finer level.
        finer_nodes: usize,
        /// Pooling factor.
        factor: usize,
    },

    /// Consecutive stages disagree on the channel width between them.
    #[error("Stage at level {level} expects {expected} input channels but the previous stage produces {found}")]
    StageChannels {
        /// Level of the consuming stage.
        level: usize,
        /// Input width declared by the stage.
        expected: i64,
        /// Output width of the previous stage.
        found: i64,
    },

    /// A pooling factor below 2 was requested.
    #[error("Invalid pooling factor {factor}: must be >= 2")]
    InvalidPoolingFactor {
        /// The rejected factor.
        factor: usize,
    },

    /// The input tensor does not have rank 3 (`[batch, nodes, channels]`).
    #[error("Expected a rank-3 [batch, nodes, channels] input, got shape {shape:?}")]
    InputRank {
        /// Shape of the rejected tensor.
        shape: Vec<i64>,
    },

    /// One dimension of the input tensor has the wrong size.
    #[error("Shape mismatch on `{dim}`: expected {expected}, got {actual}")]
    ShapeMismatch {
        /// Name of the dimension (`nodes` or `channels`).
        dim: &'static str,
        /// Expected size.
        expected: i64,
        /// Actual size.
        actual: i64,
    },
}

impl ModelError {
    /// Attach the mesh level to a graph defect.
    pub fn at_level(self, level: usize) -> Self {
        ModelError::Level { level, source: Box::new(self) }
    }

    /// Construct a [`ModelError::ShapeMismatch`].
    pub fn shape_mismatch(dim: &'static str, expected: i64, actual: i64) -> Self {
        ModelError::ShapeMismatch { dim, expected, actual }
    }

    /// `true` for structural misconfiguration detected at construction time.
    pub fn is_configuration(&self) -> bool {
        !self.is_shape_mismatch()
    }

    /// `true` for per-call input shape errors.
    pub fn is_shape_mismatch(&self) -> bool {
        matches!(self, ModelError::InputRank { .. } | ModelError::ShapeMismatch { .. })
    }
}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Errors produced when loading or validating a [`TrainingConfig`].
///
/// [`TrainingConfig`]: crate::config::TrainingConfig
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field has an invalid value.
    #[error("Invalid value for `{field}`: {reason}")]
    InvalidValue {
        /// Name of the field.
        field: &'static str,
        /// Human-readable reason.
        reason: String,
    },

    /// A configuration file could not be read from disk.
    #[error("Cannot read file {path:?}: {source}")]
    FileRead {
        /// Path that was being read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A configuration file contains malformed JSON.
    #[error("Cannot parse file {path:?}: {source}")]
    ParseError {
        /// Path that was being parsed.
        path: PathBuf,
        /// Underlying JSON parse error.
        #[source]
        source: serde_json::Error,
    },
}

impl ConfigError {
    /// Construct a [`ConfigError::InvalidValue`].
    pub fn invalid_value<S: Into<String>>(field: &'static str, reason: S) -> Self {
        ConfigError::InvalidValue { field, reason: reason.into() }
    }
}

// ---------------------------------------------------------------------------
// DatasetError
// ---------------------------------------------------------------------------

/// Errors produced while loading or accessing dataset samples.
///
/// Training code must not silently suppress these errors: a missing data
/// directory fails the run explicitly.
#[derive(Debug, Error)]
pub enum DatasetError {
    /// The data directory does not exist.
    #[error("Directory not found: {path:?}")]
    DirectoryNotFound {
        /// The path that was not found.
        path: PathBuf,
    },

    /// A sample index is out of bounds.
    #[error("Index {idx} out of bounds (dataset has {len} samples)")]
    IndexOutOfBounds {
        /// The requested index.
        idx: usize,
        /// Total length of the dataset.
        len: usize,
    },

    /// A numpy array file could not be parsed.
    #[error("NumPy read error in {path:?}: {message}")]
    NpyReadError {
        /// Path of the `.npy` file.
        path: PathBuf,
        /// Error description.
        message: String,
    },

    /// A numpy array file could not be written.
    #[error("NumPy write error in {path:?}: {message}")]
    NpyWriteError {
        /// Path of the `.npy` file.
        path: PathBuf,
        /// Error description.
        message: String,
    },

    /// A sample does not have the shape the rest of the dataset has.
    #[error("Sample `{id}` has shape {actual:?}, expected {expected:?}")]
    SampleShape {
        /// Sample identifier.
        id: String,
        /// Expected `[nodes, channels]`.
        expected: [usize; 2],
        /// Actual `[nodes, channels]`.
        actual: [usize; 2],
    },

    /// Normalization statistics do not match the data.
    #[error("Normalization statistics cover {stats} channels but samples have {channels}")]
    StatsChannels {
        /// Channels in the statistics.
        stats: usize,
        /// Channels in the sample.
        channels: usize,
    },

    /// A batch could not be assembled (empty or ragged).
    #[error("Cannot collate batch: {0}")]
    Collate(String),

    /// An I/O error that carries no path context.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DatasetError {
    /// Construct a [`DatasetError::NpyReadError`].
    pub fn npy_read<S: Into<String>>(path: impl Into<PathBuf>, msg: S) -> Self {
        DatasetError::NpyReadError { path: path.into(), message: msg.into() }
    }

    /// Construct a [`DatasetError::NpyWriteError`].
    pub fn npy_write<S: Into<String>>(path: impl Into<PathBuf>, msg: S) -> Self {
        DatasetError::NpyWriteError { path: path.into(), message: msg.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_errors_are_not_configuration_errors() {
        let err = ModelError::shape_mismatch("nodes", 12, 10);
        assert!(err.is_shape_mismatch());
        assert!(!err.is_configuration());
        assert!(err.to_string().contains("nodes"));
    }

    #[test]
    fn level_count_is_a_configuration_error() {
        let err = ModelError::LevelCount { list: "edge_index_list", expected: 6, found: 5 };
        assert!(err.is_configuration());
        assert!(err.to_string().contains("edge_index_list"));
    }

    #[test]
    fn model_error_converts_into_train_error() {
        let err: TrainError = ModelError::InvalidKernelSize { kernel_size: 0 }.into();
        assert!(matches!(err, TrainError::Model(ModelError::InvalidKernelSize { .. })));
    }
}
