//! Training loop orchestrator.
//!
//! [`Trainer::run`] splits a dataset, normalizes it with per-channel
//! statistics and hands the splits to [`Trainer::fit`], which runs
//!
//! ```text
//! for epoch in 0..n_epochs:
//!     lr ← warm-up / StepLR schedule × plateau scale
//!     train one pass (Adam, node cross-entropy)
//!     validate → per-label AP
//!     plateau monitor ← mAP over event labels
//!     early stopping  ← AP of label 1
//! ```
//!
//! A non-finite training loss ends the run early. The weights reached so far
//! are written to `model_save_dir/unet_state.ot` in every case, together with
//! the configuration; the per-epoch history goes to `log_dir/history.json`.

use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tch::{nn, nn::OptimizerConfig, Cuda, Device};
use tracing::{debug, info, warn};

use crate::config::TrainingConfig;
use crate::dataset::{
    collate, split_indices, ChannelStats, DataLoader, Normalized, SphereDataset, Subset,
};
use crate::error::{DatasetError, TrainError, TrainResult};
use crate::graph::MeshHierarchy;
use crate::losses::NodeCrossEntropy;
use crate::metrics::{MetricsAccumulator, MetricsResult};
use crate::model::SphericalUNet;
use crate::schedule::{EarlyStopping, LrSchedule};

/// File name of the saved weights inside `model_save_dir`.
pub const CHECKPOINT_FILE: &str = "unet_state.ot";

/// Label whose AP drives early stopping (tropical cyclones).
pub const EARLY_STOPPING_LABEL: usize = 1;

// ---------------------------------------------------------------------------
// Run summary types
// ---------------------------------------------------------------------------

/// Why a training run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// All configured epochs ran.
    Completed,
    /// The early-stopping label stopped improving.
    EarlyStopped,
    /// A training batch produced a NaN or infinite loss.
    NonFiniteLoss,
}

/// Metrics of one finished epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    /// Zero-based epoch index.
    pub epoch: usize,
    /// Mean training loss over the epoch's batches.
    pub train_loss: f64,
    /// Learning rate used during the epoch.
    pub learning_rate: f64,
    /// Validation metrics at the end of the epoch.
    pub validation: MetricsResult,
    /// Wall-clock duration in seconds.
    pub seconds: f64,
}

/// Outcome of [`Trainer::fit`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSummary {
    /// Completed epochs, in order.
    pub history: Vec<EpochRecord>,
    /// Why the loop ended.
    pub stop_reason: StopReason,
    /// Best AP of the early-stopping label.
    pub best_score: Option<f64>,
    /// Where the final weights were written.
    pub checkpoint_path: PathBuf,
}

impl TrainingSummary {
    /// Number of completed epochs.
    pub fn epochs_run(&self) -> usize {
        self.history.len()
    }

    /// Validation metrics of the last completed epoch.
    pub fn last_metrics(&self) -> Option<&MetricsResult> {
        self.history.last().map(|r| &r.validation)
    }
}

// ---------------------------------------------------------------------------
// Trainer
// ---------------------------------------------------------------------------

/// Orchestrates the full training loop: data loading, forward pass, loss
/// computation, back-propagation, validation, and checkpointing.
pub struct Trainer {
    config: TrainingConfig,
    device: Device,
}

impl Trainer {
    /// Create a new `Trainer`; selects CUDA when requested and available.
    pub fn new(config: TrainingConfig) -> Self {
        let device = if config.use_gpu {
            if Cuda::is_available() {
                Device::Cuda(config.gpu_device_id.max(0) as usize)
            } else {
                warn!("CUDA requested but not available; training on CPU");
                Device::Cpu
            }
        } else {
            Device::Cpu
        };
        Trainer { config, device }
    }

    /// Return a reference to the active training configuration.
    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Device the model and batches live on.
    pub fn device(&self) -> Device {
        self.device
    }

    /// Seed libtorch and build the network described by `config.model`.
    pub fn build_model(&self, hierarchy: &MeshHierarchy) -> TrainResult<SphericalUNet> {
        tch::manual_seed(self.config.seed as i64);
        Ok(SphericalUNet::new(hierarchy, &self.config.model, self.device)?)
    }

    /// Normalization statistics: read from the configured `.npy` files, or
    /// computed from `train` and written to `model_save_dir`.
    pub fn channel_stats(&self, train: &dyn SphereDataset) -> TrainResult<ChannelStats> {
        if let (Some(means), Some(stds)) = (&self.config.means_path, &self.config.stds_path) {
            info!(means = %means.display(), stds = %stds.display(), "loading channel statistics");
            return Ok(ChannelStats::from_npy(means, stds)?);
        }
        let stats = ChannelStats::from_dataset(train)?;
        let (means, stds) = stats.write_npy(&self.config.model_save_dir)?;
        info!(means = %means.display(), stds = %stds.display(), "wrote channel statistics");
        Ok(stats)
    }

    /// Split `dataset`, normalize it and train `model` on it.
    ///
    /// # Errors
    ///
    /// [`TrainError::EmptyDataset`] when the train or validation split is
    /// empty; otherwise any error of [`Trainer::fit`] or of the statistics.
    pub fn run(&self, model: &SphericalUNet, dataset: &dyn SphereDataset) -> TrainResult<TrainingSummary> {
        let (train_idx, val_idx, test_idx) =
            split_indices(dataset.len(), self.config.partition, self.config.seed);
        info!(
            dataset = dataset.name(),
            train = train_idx.len(),
            validation = val_idx.len(),
            test = test_idx.len(),
            "split dataset"
        );
        let train = Subset::new(dataset, train_idx, "train");
        let val = Subset::new(dataset, val_idx, "validation");
        if train.is_empty() {
            return Err(TrainError::EmptyDataset { split: "train" });
        }

        let stats = self.channel_stats(&train)?;
        let expected = model.input_channels() as usize;
        if stats.num_channels() != expected {
            return Err(DatasetError::StatsChannels {
                stats: stats.num_channels(),
                channels: expected,
            }
            .into());
        }
        let train = Normalized::new(&train, &stats);
        let val = Normalized::new(&val, &stats);
        self.fit(model, &train, &val)
    }

    /// Train `model` on `train`, validating on `val` after every epoch.
    ///
    /// # Errors
    ///
    /// [`TrainError::EmptyDataset`] for an empty split, sample and shape
    /// errors from the data, and I/O errors while saving outputs.
    pub fn fit(
        &self,
        model: &SphericalUNet,
        train: &dyn SphereDataset,
        val: &dyn SphereDataset,
    ) -> TrainResult<TrainingSummary> {
        if train.is_empty() {
            return Err(TrainError::EmptyDataset { split: "train" });
        }
        if val.is_empty() {
            return Err(TrainError::EmptyDataset { split: "validation" });
        }

        let cfg = &self.config;
        let mut optimizer = nn::Adam::default().build(model.var_store(), cfg.learning_rate)?;
        let loss_fn = NodeCrossEntropy::from_weights(cfg.class_weights.as_deref());
        let mut schedule = LrSchedule::from_config(cfg);
        let mut stopper = EarlyStopping::new(cfg.early_stopping_patience);
        let loader = DataLoader::new(train, cfg.batch_size, true, cfg.seed);

        info!(
            epochs = cfg.n_epochs,
            batches = loader.num_batches(),
            device = ?self.device,
            "starting training"
        );

        let mut history = Vec::with_capacity(cfg.n_epochs);
        let mut stop_reason = StopReason::Completed;
        'epochs: for epoch in 0..cfg.n_epochs {
            let start = Instant::now();
            let lr = schedule.lr_at(epoch);
            optimizer.set_lr(lr);

            let mut loss_sum = 0.0f64;
            let mut batches = 0usize;
            for batch in loader.epoch(epoch) {
                let batch = batch?;
                let (x, y) = collate(&batch, self.device)?;
                let logits = model.forward_train(&x)?;
                let loss = loss_fn.forward(&logits, &y)?;
                let value = loss.double_value(&[]);
                if !value.is_finite() {
                    warn!(epoch, batch = batches, "non-finite training loss; stopping");
                    stop_reason = StopReason::NonFiniteLoss;
                    break 'epochs;
                }
                optimizer.backward_step(&loss);
                loss_sum += value;
                batches += 1;
                debug!(epoch, batch = batches, loss = value, "train step");
            }
            let train_loss = loss_sum / batches.max(1) as f64;

            let validation = self.evaluate(model, val)?;
            if schedule.observe(validation.mean_average_precision.unwrap_or(f64::NAN)) {
                info!(epoch, "validation mAP plateaued; reducing learning rate");
            }
            let score = validation.label_ap(EARLY_STOPPING_LABEL).unwrap_or(f64::NAN);
            let stop = stopper.step(score);

            info!(
                epoch,
                train_loss,
                lr,
                "{}",
                validation.summary()
            );
            history.push(EpochRecord {
                epoch,
                train_loss,
                learning_rate: lr,
                validation,
                seconds: start.elapsed().as_secs_f64(),
            });
            if stop {
                info!(epoch, best = ?stopper.best(), "early stopping");
                stop_reason = StopReason::EarlyStopped;
                break;
            }
        }

        let checkpoint_path = self.save_outputs(model, &history)?;
        info!(
            epochs = history.len(),
            reason = ?stop_reason,
            path = %checkpoint_path.display(),
            "training finished"
        );
        Ok(TrainingSummary {
            history,
            stop_reason,
            best_score: stopper.best(),
            checkpoint_path,
        })
    }

    /// Per-label AP of `model` on `dataset`.
    pub fn evaluate(&self, model: &SphericalUNet, dataset: &dyn SphereDataset) -> TrainResult<MetricsResult> {
        let loader = DataLoader::new(dataset, self.config.batch_size, false, self.config.seed);
        let mut acc = MetricsAccumulator::new();
        for batch in loader.iter() {
            let (x, y) = collate(&batch?, self.device)?;
            let probs = model.forward_inference(&x)?;
            acc.update(&probs, &y)?;
        }
        Ok(acc.finalize())
    }

    fn save_outputs(&self, model: &SphericalUNet, history: &[EpochRecord]) -> TrainResult<PathBuf> {
        let save_dir = &self.config.model_save_dir;
        create_dir(save_dir)?;
        let checkpoint_path = save_dir.join(CHECKPOINT_FILE);
        model.save(&checkpoint_path)?;
        self.config.to_json(&save_dir.join("config.json"))?;

        create_dir(&self.config.log_dir)?;
        let history_path = self.config.log_dir.join("history.json");
        let json = serde_json::to_string_pretty(history)?;
        std::fs::write(&history_path, json)
            .map_err(|e| TrainError::checkpoint(format!("cannot write history: {e}"), &history_path))?;
        Ok(checkpoint_path)
    }
}

fn create_dir(dir: &Path) -> TrainResult<()> {
    std::fs::create_dir_all(dir)
        .map_err(|e| TrainError::checkpoint(format!("cannot create directory: {e}"), dir))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{SyntheticConfig, SyntheticSphereDataset};
    use crate::model::UNetConfig;
    use tempfile::TempDir;

    fn tiny_config(dir: &TempDir) -> TrainingConfig {
        TrainingConfig {
            model: UNetConfig { pooling_factor: 2, ..UNetConfig::default() },
            partition: [0.5, 0.25, 0.25],
            batch_size: 2,
            n_epochs: 2,
            warmup_duration: 1,
            model_save_dir: dir.path().join("ckpt"),
            log_dir: dir.path().join("logs"),
            ..TrainingConfig::default()
        }
    }

    fn tiny_dataset() -> SyntheticSphereDataset {
        SyntheticSphereDataset::new(8, SyntheticConfig { num_nodes: 64, ..SyntheticConfig::default() })
    }

    #[test]
    fn cpu_when_gpu_not_requested() {
        let trainer = Trainer::new(TrainingConfig::default());
        assert_eq!(trainer.device(), Device::Cpu);
    }

    #[test]
    fn run_trains_and_writes_outputs() {
        let dir = TempDir::new().unwrap();
        let trainer = Trainer::new(tiny_config(&dir));
        let hierarchy = MeshHierarchy::synthetic(2, 2).unwrap();
        let model = trainer.build_model(&hierarchy).unwrap();

        let summary = trainer.run(&model, &tiny_dataset()).unwrap();
        assert!(summary.epochs_run() >= 1);
        assert!(summary.checkpoint_path.exists());
        assert!(dir.path().join("ckpt/config.json").exists());
        assert!(dir.path().join("ckpt/means.npy").exists());
        assert!(dir.path().join("ckpt/stds.npy").exists());
        assert!(dir.path().join("logs/history.json").exists());
        for record in &summary.history {
            assert!(record.train_loss.is_finite());
            assert_eq!(record.validation.average_precision.len(), 3);
        }
    }

    #[test]
    fn empty_validation_split_is_an_error() {
        let dir = TempDir::new().unwrap();
        let trainer = Trainer::new(tiny_config(&dir));
        let hierarchy = MeshHierarchy::synthetic(2, 2).unwrap();
        let model = trainer.build_model(&hierarchy).unwrap();
        let ds = tiny_dataset();
        let empty = Subset::new(&ds, Vec::new(), "validation");
        let err = trainer.fit(&model, &ds, &empty).unwrap_err();
        assert!(matches!(err, TrainError::EmptyDataset { split: "validation" }));
    }
}
