//! Learning-rate schedules and early stopping, stepped once per epoch.
//!
//! The effective learning rate of epoch `e` is
//!
//! ```text
//! lr(e) = base(e) · plateau_scale
//! base(e) = start + (end − start) · e / (W − 1)       e < W   (linear warm-up)
//!         = end · γ^⌊(e − W) / step⌋                  e ≥ W   (StepLR)
//! ```
//!
//! where `plateau_scale` starts at 1 and is multiplied by the plateau factor
//! every time the monitored validation metric stalls for `patience` epochs.

use serde::{Deserialize, Serialize};

use crate::config::TrainingConfig;

/// Relative improvement below which a metric counts as stalled.
const PLATEAU_THRESHOLD: f64 = 1e-4;

// ---------------------------------------------------------------------------
// Warm-up + StepLR
// ---------------------------------------------------------------------------

/// Linear warm-up followed by step decay.
#[derive(Debug, Clone, PartialEq)]
pub struct WarmupStepLr {
    start: f64,
    end: f64,
    duration: usize,
    step_size: usize,
    gamma: f64,
}

impl WarmupStepLr {
    /// Warm-up from `start` to `end` over `duration` epochs, then multiply by
    /// `gamma` every `step_size` epochs. `step_size` is clamped to 1.
    pub fn new(start: f64, end: f64, duration: usize, step_size: usize, gamma: f64) -> Self {
        WarmupStepLr { start, end, duration, step_size: step_size.max(1), gamma }
    }

    /// Learning rate of zero-based `epoch`.
    pub fn lr_at(&self, epoch: usize) -> f64 {
        if epoch < self.duration {
            if self.duration == 1 {
                return self.end;
            }
            let t = epoch as f64 / (self.duration - 1) as f64;
            return self.start + (self.end - self.start) * t;
        }
        let steps = (epoch - self.duration) / self.step_size;
        self.end * self.gamma.powi(steps as i32)
    }
}

// ---------------------------------------------------------------------------
// ReduceLrOnPlateau
// ---------------------------------------------------------------------------

/// Direction in which the monitored metric improves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlateauMode {
    /// Higher is better (e.g. mAP).
    #[default]
    Max,
    /// Lower is better (e.g. loss).
    Min,
}

impl PlateauMode {
    fn improves(&self, value: f64, best: f64) -> bool {
        match self {
            PlateauMode::Max => value > best + PLATEAU_THRESHOLD * best.abs(),
            PlateauMode::Min => value < best - PLATEAU_THRESHOLD * best.abs(),
        }
    }
}

/// Multiplicative learning-rate reduction when a metric stops improving.
#[derive(Debug, Clone, PartialEq)]
pub struct ReduceLrOnPlateau {
    mode: PlateauMode,
    factor: f64,
    patience: usize,
    best: Option<f64>,
    bad_epochs: usize,
    scale: f64,
}

impl ReduceLrOnPlateau {
    /// Reduce by `factor` after more than `patience` stalled epochs.
    pub fn new(mode: PlateauMode, factor: f64, patience: usize) -> Self {
        ReduceLrOnPlateau { mode, factor, patience, best: None, bad_epochs: 0, scale: 1.0 }
    }

    /// Record one epoch's metric. Returns `true` if the scale was reduced.
    ///
    /// Non-finite values count as stalled epochs.
    pub fn step(&mut self, metric: f64) -> bool {
        let improved = metric.is_finite()
            && self.best.map_or(true, |best| self.mode.improves(metric, best));
        if improved {
            self.best = Some(metric);
            self.bad_epochs = 0;
            return false;
        }
        self.bad_epochs += 1;
        if self.bad_epochs > self.patience {
            self.scale *= self.factor;
            self.bad_epochs = 0;
            return true;
        }
        false
    }

    /// Current multiplier on the base learning rate.
    pub fn scale(&self) -> f64 {
        self.scale
    }
}

// ---------------------------------------------------------------------------
// EarlyStopping
// ---------------------------------------------------------------------------

/// Stop once a higher-is-better score has not improved for `patience` epochs.
#[derive(Debug, Clone, PartialEq)]
pub struct EarlyStopping {
    patience: usize,
    best: Option<f64>,
    counter: usize,
}

impl EarlyStopping {
    /// Early stopping with the given patience.
    pub fn new(patience: usize) -> Self {
        EarlyStopping { patience, best: None, counter: 0 }
    }

    /// Record one epoch's score. Returns `true` when training should stop.
    pub fn step(&mut self, score: f64) -> bool {
        match self.best {
            Some(best) if !(score > best) => {
                self.counter += 1;
                self.counter >= self.patience
            }
            _ => {
                if score.is_finite() {
                    self.best = Some(score);
                    self.counter = 0;
                    false
                } else {
                    self.counter += 1;
                    self.counter >= self.patience
                }
            }
        }
    }

    /// Best score seen so far.
    pub fn best(&self) -> Option<f64> {
        self.best
    }
}

// ---------------------------------------------------------------------------
// LrSchedule
// ---------------------------------------------------------------------------

/// Warm-up/StepLR base schedule combined with plateau reduction.
#[derive(Debug, Clone, PartialEq)]
pub struct LrSchedule {
    base: WarmupStepLr,
    plateau: ReduceLrOnPlateau,
}

impl LrSchedule {
    /// Combine the two schedules.
    pub fn new(base: WarmupStepLr, plateau: ReduceLrOnPlateau) -> Self {
        LrSchedule { base, plateau }
    }

    /// Build from the schedule fields of `config`.
    pub fn from_config(config: &TrainingConfig) -> Self {
        Self::new(
            WarmupStepLr::new(
                config.warmup_start_value,
                config.warmup_end_value,
                config.warmup_duration,
                config.steplr_step_size,
                config.steplr_gamma,
            ),
            ReduceLrOnPlateau::new(
                config.plateau_mode,
                config.plateau_factor,
                config.plateau_patience,
            ),
        )
    }

    /// Learning rate to use during zero-based `epoch`.
    pub fn lr_at(&self, epoch: usize) -> f64 {
        self.base.lr_at(epoch) * self.plateau.scale()
    }

    /// Feed the epoch's validation metric to the plateau monitor. Returns
    /// `true` if the learning rate was reduced.
    pub fn observe(&mut self, metric: f64) -> bool {
        self.plateau.step(metric)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn warmup_is_linear_and_reaches_end_value() {
        let s = WarmupStepLr::new(0.0, 1.0, 5, 2, 0.5);
        assert!(close(s.lr_at(0), 0.0));
        assert!(close(s.lr_at(2), 0.5));
        assert!(close(s.lr_at(4), 1.0));
    }

    #[test]
    fn step_decay_after_warmup() {
        let s = WarmupStepLr::new(0.1, 1.0, 2, 3, 0.5);
        assert!(close(s.lr_at(2), 1.0));
        assert!(close(s.lr_at(4), 1.0));
        assert!(close(s.lr_at(5), 0.5));
        assert!(close(s.lr_at(8), 0.25));
    }

    #[test]
    fn no_warmup_starts_at_end_value() {
        let s = WarmupStepLr::new(0.1, 1.0, 0, 10, 0.5);
        assert!(close(s.lr_at(0), 1.0));
    }

    #[test]
    fn plateau_reduces_after_patience() {
        let mut p = ReduceLrOnPlateau::new(PlateauMode::Max, 0.1, 2);
        assert!(!p.step(0.5));
        assert!(!p.step(0.4));
        assert!(!p.step(0.5));
        assert!(p.step(0.3));
        assert!(close(p.scale(), 0.1));
        assert!(!p.step(0.9));
    }

    #[test]
    fn plateau_min_mode_tracks_decrease() {
        let mut p = ReduceLrOnPlateau::new(PlateauMode::Min, 0.5, 0);
        assert!(!p.step(1.0));
        assert!(!p.step(0.5));
        assert!(p.step(0.5));
        assert!(close(p.scale(), 0.5));
    }

    #[test]
    fn early_stopping_counts_stalled_epochs() {
        let mut e = EarlyStopping::new(2);
        assert!(!e.step(0.1));
        assert!(!e.step(0.2));
        assert!(!e.step(0.2));
        assert!(e.step(0.15));
        assert_eq!(e.best(), Some(0.2));
    }

    #[test]
    fn nan_score_never_becomes_best() {
        let mut e = EarlyStopping::new(3);
        assert!(!e.step(f64::NAN));
        assert_eq!(e.best(), None);
        assert!(!e.step(0.1));
        assert_eq!(e.best(), Some(0.1));
    }

    #[test]
    fn schedule_combines_base_and_plateau() {
        let mut s = LrSchedule::new(
            WarmupStepLr::new(1.0, 1.0, 0, 100, 0.5),
            ReduceLrOnPlateau::new(PlateauMode::Max, 0.5, 0),
        );
        s.observe(1.0);
        assert!(s.observe(0.5));
        assert!(close(s.lr_at(3), 0.5));
    }
}
