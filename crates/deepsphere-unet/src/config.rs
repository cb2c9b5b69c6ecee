//! Training configuration for the Spherical U-Net.
//!
//! [`TrainingConfig`] is the single source of truth for the architecture,
//! data split, optimiser, learning-rate schedules and output locations of a
//! training run. It is serializable via [`serde`] so it can be stored next to
//! the trained weights and restored from JSON.
//!
//! # Example
//!
//! ```rust
//! use deepsphere_unet::config::TrainingConfig;
//!
//! let cfg = TrainingConfig::default();
//! cfg.validate().expect("default config is valid");
//!
//! assert_eq!(cfg.model.kernel_size, 3);
//! assert_eq!(cfg.model.out_channels, 3);
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::encoder::INPUT_CHANNELS;
use crate::error::ConfigError;
use crate::model::UNetConfig;
use crate::schedule::PlateauMode;

// ---------------------------------------------------------------------------
// TrainingConfig
// ---------------------------------------------------------------------------

/// Complete configuration for a Spherical U-Net training run.
///
/// Use [`TrainingConfig::default()`] as a starting point, then override
/// individual fields as needed. Missing fields in a JSON file take their
/// default value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    // -----------------------------------------------------------------------
    // Model
    // -----------------------------------------------------------------------
    /// Architecture hyper-parameters.
    pub model: UNetConfig,

    // -----------------------------------------------------------------------
    // Data
    // -----------------------------------------------------------------------
    /// Directory holding `<id>_data.npy` / `<id>_labels.npy` pairs.
    pub data_dir: PathBuf,

    /// Mesh hierarchy JSON produced by the mesh generator.
    pub graph_path: Option<PathBuf>,

    /// Train / validation / test fractions. Default: **[0.7, 0.2, 0.1]**.
    pub partition: [f64; 3],

    /// Per-channel means (`.npy`); computed from the training split when
    /// either statistics path is unset.
    pub means_path: Option<PathBuf>,

    /// Per-channel standard deviations (`.npy`).
    pub stds_path: Option<PathBuf>,

    // -----------------------------------------------------------------------
    // Optimisation
    // -----------------------------------------------------------------------
    /// Mini-batch size. Default: **8**.
    pub batch_size: usize,

    /// Learning rate the optimiser is created with. Default: **1e-3**.
    pub learning_rate: f64,

    /// Total number of training epochs. Default: **30**.
    pub n_epochs: usize,

    /// Per-label cross-entropy weights; `None` weighs every label equally.
    pub class_weights: Option<Vec<f32>>,

    // -----------------------------------------------------------------------
    // Learning-rate schedules
    // -----------------------------------------------------------------------
    /// Epochs between two StepLR decays. Default: **5**.
    pub steplr_step_size: usize,

    /// StepLR decay factor. Default: **0.5**.
    pub steplr_gamma: f64,

    /// Learning rate at the first warm-up epoch. Default: **1e-4**.
    pub warmup_start_value: f64,

    /// Learning rate reached at the end of warm-up. Default: **1e-3**.
    pub warmup_end_value: f64,

    /// Warm-up length in epochs; `0` disables warm-up. Default: **5**.
    pub warmup_duration: usize,

    /// Whether the plateau monitor expects mAP to rise or fall. Default: **max**.
    pub plateau_mode: PlateauMode,

    /// Factor applied to the learning rate on a plateau. Default: **0.1**.
    pub plateau_factor: f64,

    /// Epochs without improvement before a plateau reduction. Default: **3**.
    pub plateau_patience: usize,

    /// Epochs without improvement of the tropical-cyclone AP before
    /// training stops. Default: **5**.
    pub early_stopping_patience: usize,

    // -----------------------------------------------------------------------
    // Device
    // -----------------------------------------------------------------------
    /// Use a CUDA GPU for training when available. Default: **false**.
    pub use_gpu: bool,

    /// CUDA device index when `use_gpu` is `true`. Default: **0**.
    pub gpu_device_id: i64,

    // -----------------------------------------------------------------------
    // Output
    // -----------------------------------------------------------------------
    /// Directory receiving `unet_state.ot`, `config.json` and computed
    /// normalization statistics.
    pub model_save_dir: PathBuf,

    /// Directory receiving the per-epoch history (`history.json`).
    pub log_dir: PathBuf,

    // -----------------------------------------------------------------------
    // Reproducibility
    // -----------------------------------------------------------------------
    /// Seed for the data split, the loader shuffle and parameter
    /// initialisation. Default: **42**.
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            model: UNetConfig::default(),
            // Data
            data_dir: PathBuf::from("data"),
            graph_path: None,
            partition: [0.7, 0.2, 0.1],
            means_path: None,
            stds_path: None,
            // Optimisation
            batch_size: 8,
            learning_rate: 1e-3,
            n_epochs: 30,
            class_weights: None,
            // Schedules
            steplr_step_size: 5,
            steplr_gamma: 0.5,
            warmup_start_value: 1e-4,
            warmup_end_value: 1e-3,
            warmup_duration: 5,
            plateau_mode: PlateauMode::Max,
            plateau_factor: 0.1,
            plateau_patience: 3,
            early_stopping_patience: 5,
            // Device
            use_gpu: false,
            gpu_device_id: 0,
            // Output
            model_save_dir: PathBuf::from("checkpoints"),
            log_dir: PathBuf::from("logs"),
            seed: 42,
        }
    }
}

impl TrainingConfig {
    /// Load a [`TrainingConfig`] from a JSON file at `path` and validate it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::FileRead`] if the file cannot be opened,
    /// [`ConfigError::ParseError`] if the JSON is malformed and
    /// [`ConfigError::InvalidValue`] if a field is out of range.
    pub fn from_json(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg: TrainingConfig = serde_json::from_str(&contents).map_err(|source| {
            ConfigError::ParseError { path: path.to_path_buf(), source }
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize this configuration to pretty-printed JSON and write it to
    /// `path`, creating parent directories if necessary.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::FileRead`] if the directory cannot be created or
    /// the file cannot be written.
    pub fn to_json(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::FileRead {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::invalid_value("(serialization)", e.to_string()))?;
        std::fs::write(path, json).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    /// Input channels the dataset must provide
    /// ([`INPUT_CHANNELS`] per frame of the sequence).
    pub fn input_channels(&self) -> usize {
        INPUT_CHANNELS as usize * self.model.sequence_length
    }

    /// Validate all fields and return an error describing the first problem
    /// found, or `Ok(())` if the configuration is coherent.
    ///
    /// # Validated invariants
    ///
    /// - Kernel size, sequence length and label count are at least 1; the
    ///   pooling factor is at least 2.
    /// - Partition fractions are non-negative, sum to 1 and leave a
    ///   non-empty share for training and validation.
    /// - `batch_size`, `n_epochs`, `steplr_step_size` and both patiences are
    ///   at least 1.
    /// - Learning rates are strictly positive; `steplr_gamma` lies in
    ///   `(0, 1]` and `plateau_factor` in `(0, 1)`.
    /// - `class_weights`, when set, has one non-negative entry per label.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Model
        if self.model.kernel_size == 0 {
            return Err(ConfigError::invalid_value("model.kernel_size", "must be > 0"));
        }
        if self.model.pooling_factor < 2 {
            return Err(ConfigError::invalid_value("model.pooling_factor", "must be >= 2"));
        }
        if self.model.out_channels == 0 {
            return Err(ConfigError::invalid_value("model.out_channels", "must be > 0"));
        }
        if self.model.sequence_length == 0 {
            return Err(ConfigError::invalid_value("model.sequence_length", "must be > 0"));
        }

        // Partition
        if self.partition.iter().any(|p| !p.is_finite() || *p < 0.0) {
            return Err(ConfigError::invalid_value(
                "partition",
                "fractions must be finite and >= 0.0",
            ));
        }
        let total: f64 = self.partition.iter().sum();
        if (total - 1.0).abs() > 1e-6 {
            return Err(ConfigError::invalid_value(
                "partition",
                format!("fractions must sum to 1.0, got {total}"),
            ));
        }
        if self.partition[0] <= 0.0 || self.partition[1] <= 0.0 {
            return Err(ConfigError::invalid_value(
                "partition",
                "train and validation fractions must be > 0.0",
            ));
        }
        if self.means_path.is_some() != self.stds_path.is_some() {
            return Err(ConfigError::invalid_value(
                "means_path / stds_path",
                "set both or neither",
            ));
        }

        // Optimisation
        if self.batch_size == 0 {
            return Err(ConfigError::invalid_value("batch_size", "must be > 0"));
        }
        if self.learning_rate <= 0.0 {
            return Err(ConfigError::invalid_value("learning_rate", "must be > 0.0"));
        }
        if self.n_epochs == 0 {
            return Err(ConfigError::invalid_value("n_epochs", "must be > 0"));
        }
        if let Some(weights) = &self.class_weights {
            if weights.len() != self.model.out_channels {
                return Err(ConfigError::invalid_value(
                    "class_weights",
                    format!(
                        "expected {} weights, got {}",
                        self.model.out_channels,
                        weights.len()
                    ),
                ));
            }
            if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
                return Err(ConfigError::invalid_value("class_weights", "must be >= 0.0"));
            }
        }

        // Schedules
        if self.steplr_step_size == 0 {
            return Err(ConfigError::invalid_value("steplr_step_size", "must be > 0"));
        }
        if self.steplr_gamma <= 0.0 || self.steplr_gamma > 1.0 {
            return Err(ConfigError::invalid_value("steplr_gamma", "must be in (0.0, 1.0]"));
        }
        if self.warmup_start_value <= 0.0 {
            return Err(ConfigError::invalid_value("warmup_start_value", "must be > 0.0"));
        }
        if self.warmup_end_value <= 0.0 {
            return Err(ConfigError::invalid_value("warmup_end_value", "must be > 0.0"));
        }
        if self.plateau_factor <= 0.0 || self.plateau_factor >= 1.0 {
            return Err(ConfigError::invalid_value("plateau_factor", "must be in (0.0, 1.0)"));
        }
        if self.plateau_patience == 0 {
            return Err(ConfigError::invalid_value("plateau_patience", "must be > 0"));
        }
        if self.early_stopping_patience == 0 {
            return Err(ConfigError::invalid_value("early_stopping_patience", "must be > 0"));
        }

        // Device
        if self.gpu_device_id < 0 {
            return Err(ConfigError::invalid_value("gpu_device_id", "must be >= 0"));
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::LaplacianType;
    use tempfile::tempdir;

    #[test]
    fn default_config_is_valid() {
        let cfg = TrainingConfig::default();
        cfg.validate().expect("default config should be valid");
    }

    #[test]
    fn json_round_trip() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("config.json");

        let mut original = TrainingConfig::default();
        original.model.laplacian_type = LaplacianType::Combinatorial;
        original.graph_path = Some(PathBuf::from("mesh.json"));
        original.to_json(&path).expect("serialization should succeed");

        let loaded = TrainingConfig::from_json(&path).expect("deserialization should succeed");
        assert_eq!(loaded, original);
    }

    #[test]
    fn partial_json_takes_defaults() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, r#"{"batch_size": 2, "model": {"kernel_size": 4}}"#).unwrap();

        let cfg = TrainingConfig::from_json(&path).unwrap();
        assert_eq!(cfg.batch_size, 2);
        assert_eq!(cfg.model.kernel_size, 4);
        assert_eq!(cfg.model.out_channels, 3);
        assert_eq!(cfg.n_epochs, TrainingConfig::default().n_epochs);
    }

    #[test]
    fn unknown_laplacian_type_is_a_parse_error() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, r#"{"model": {"laplacian_type": "invalid"}}"#).unwrap();

        let err = TrainingConfig::from_json(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn zero_kernel_size_is_invalid() {
        let mut cfg = TrainingConfig::default();
        cfg.model.kernel_size = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partition_must_sum_to_one() {
        let mut cfg = TrainingConfig::default();
        cfg.partition = [0.5, 0.2, 0.1];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn empty_validation_share_is_invalid() {
        let mut cfg = TrainingConfig::default();
        cfg.partition = [0.9, 0.0, 0.1];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn half_specified_statistics_are_invalid() {
        let mut cfg = TrainingConfig::default();
        cfg.means_path = Some(PathBuf::from("means.npy"));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn class_weights_must_match_labels() {
        let mut cfg = TrainingConfig::default();
        cfg.class_weights = Some(vec![1.0, 2.0]);
        assert!(cfg.validate().is_err());
        cfg.class_weights = Some(vec![1.0, 2.0, 2.0]);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn input_channels_scale_with_sequence_length() {
        let mut cfg = TrainingConfig::default();
        assert_eq!(cfg.input_channels(), 16);
        cfg.model.sequence_length = 4;
        assert_eq!(cfg.input_channels(), 64);
    }
}
