//! Evaluation metrics for per-node event segmentation.
//!
//! Validation follows the multi-label average-precision protocol: every
//! node of every validation sample is one prediction, each label column is
//! ranked independently and summarized as
//!
//! ```text
//! AP = Σₙ (Rₙ − Rₙ₋₁) · Pₙ
//! ```
//!
//! over the distinct score thresholds `n` (tied scores form one threshold).
//! Label 0 is the background; the mean AP reported for model selection
//! averages labels `1..L` only.

use ndarray::{Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};
use tch::{Device, Kind, TchError, Tensor};

/// A label counts as present when its target value exceeds this threshold.
const POSITIVE_THRESHOLD: f32 = 0.5;

// ---------------------------------------------------------------------------
// Average precision
// ---------------------------------------------------------------------------

/// Step-wise average precision of one label.
///
/// Returns `None` when `targets` holds no positive entry, where precision
/// and recall are undefined. Scores that are NaN rank last.
///
/// # Panics
///
/// Panics if `scores` and `targets` differ in length.
pub fn average_precision(scores: &[f32], targets: &[bool]) -> Option<f64> {
    assert_eq!(scores.len(), targets.len(), "scores and targets must have the same length");
    let total_positives = targets.iter().filter(|t| **t).count();
    if total_positives == 0 {
        return None;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| rank_key(scores[b]).total_cmp(&rank_key(scores[a])));

    let mut tp = 0usize;
    let mut fp = 0usize;
    let mut prev_recall = 0.0f64;
    let mut ap = 0.0f64;
    for (pos, &i) in order.iter().enumerate() {
        if targets[i] {
            tp += 1;
        } else {
            fp += 1;
        }
        let threshold_ends = order
            .get(pos + 1)
            .map_or(true, |&next| rank_key(scores[next]) != rank_key(scores[i]));
        if threshold_ends {
            let recall = tp as f64 / total_positives as f64;
            let precision = tp as f64 / (tp + fp) as f64;
            ap += (recall - prev_recall) * precision;
            prev_recall = recall;
        }
    }
    Some(ap)
}

fn rank_key(score: f32) -> f32 {
    if score.is_nan() {
        f32::NEG_INFINITY
    } else {
        score
    }
}

/// Average precision of every column of `scores` against `targets`
/// (`[num_predictions, num_labels]` each).
///
/// # Panics
///
/// Panics if the two arrays differ in shape.
pub fn average_precision_per_label(scores: &Array2<f32>, targets: &Array2<f32>) -> Vec<Option<f64>> {
    assert_eq!(scores.dim(), targets.dim(), "scores and targets must have the same shape");
    scores
        .axis_iter(Axis(1))
        .zip(targets.axis_iter(Axis(1)))
        .map(|(s, t)| column_average_precision(s, t))
        .collect()
}

fn column_average_precision(scores: ArrayView1<'_, f32>, targets: ArrayView1<'_, f32>) -> Option<f64> {
    let scores: Vec<f32> = scores.iter().copied().collect();
    let targets: Vec<bool> = targets.iter().map(|&t| t > POSITIVE_THRESHOLD).collect();
    average_precision(&scores, &targets)
}

// ---------------------------------------------------------------------------
// MetricsResult
// ---------------------------------------------------------------------------

/// Aggregated validation metrics for one epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsResult {
    /// AP of every label; `None` for labels absent from the targets.
    pub average_precision: Vec<Option<f64>>,
    /// Mean AP over the event labels `1..L` that have an AP.
    pub mean_average_precision: Option<f64>,
    /// Number of scored nodes.
    pub num_nodes: usize,
}

impl MetricsResult {
    /// Build from per-label APs.
    pub fn from_average_precision(average_precision: Vec<Option<f64>>, num_nodes: usize) -> Self {
        let events: Vec<f64> = average_precision.iter().skip(1).flatten().copied().collect();
        let mean_average_precision = if events.is_empty() {
            None
        } else {
            Some(events.iter().sum::<f64>() / events.len() as f64)
        };
        MetricsResult { average_precision, mean_average_precision, num_nodes }
    }

    /// AP of `label`, if it was defined.
    pub fn label_ap(&self, label: usize) -> Option<f64> {
        self.average_precision.get(label).copied().flatten()
    }

    /// A human-readable summary line suitable for logging.
    pub fn summary(&self) -> String {
        let aps: Vec<String> = self
            .average_precision
            .iter()
            .map(|ap| ap.map_or_else(|| "n/a".to_string(), |v| format!("{v:.4}")))
            .collect();
        let map = self
            .mean_average_precision
            .map_or_else(|| "n/a".to_string(), |v| format!("{v:.4}"));
        format!("mAP={map}  AP=[{}]  (n_nodes={})", aps.join(", "), self.num_nodes)
    }
}

// ---------------------------------------------------------------------------
// MetricsAccumulator
// ---------------------------------------------------------------------------

/// Running collection of node predictions across a validation epoch.
///
/// AP is not decomposable over batches, so every score is kept until
/// [`MetricsAccumulator::finalize`].
#[derive(Debug, Clone, Default)]
pub struct MetricsAccumulator {
    num_labels: Option<usize>,
    scores: Vec<f32>,
    targets: Vec<f32>,
}

impl MetricsAccumulator {
    /// Empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a batch of probabilities and labels, both `[B, N, L]`.
    ///
    /// # Errors
    ///
    /// Returns a [`TchError`] when the tensors differ in shape or do not share
    /// the label count of previous batches.
    pub fn update(&mut self, probs: &Tensor, labels: &Tensor) -> Result<(), TchError> {
        let size = probs.size();
        if size != labels.size() {
            return Err(TchError::Shape(format!(
                "probabilities {size:?} and labels {:?} differ in shape",
                labels.size()
            )));
        }
        let num_labels = size.last().copied().unwrap_or(0);
        if num_labels < 1 {
            return Err(TchError::Shape(format!("no label axis in shape {size:?}")));
        }
        let flatten = |t: &Tensor| -> Result<Vec<f32>, TchError> {
            let flat = t.detach().to_device(Device::Cpu).to_kind(Kind::Float).reshape([-1]);
            Vec::<f32>::try_from(&flat)
        };
        let scores = flatten(probs)?;
        let targets = flatten(labels)?;
        self.update_from_slices(&scores, &targets, num_labels as usize)
            .map_err(TchError::Shape)
    }

    /// Add row-major `[num_nodes, num_labels]` predictions.
    ///
    /// # Errors
    ///
    /// Returns a message when the slices do not hold whole rows of
    /// `num_labels` or `num_labels` changes between calls.
    pub fn update_from_slices(
        &mut self,
        scores: &[f32],
        targets: &[f32],
        num_labels: usize,
    ) -> Result<(), String> {
        if num_labels == 0 || scores.len() != targets.len() || scores.len() % num_labels != 0 {
            return Err(format!(
                "{} scores and {} targets do not form rows of {num_labels} labels",
                scores.len(),
                targets.len()
            ));
        }
        match self.num_labels {
            Some(n) if n != num_labels => {
                return Err(format!("expected {n} labels per node, got {num_labels}"));
            }
            _ => self.num_labels = Some(num_labels),
        }
        self.scores.extend_from_slice(scores);
        self.targets.extend_from_slice(targets);
        Ok(())
    }

    /// Number of nodes collected so far.
    pub fn num_nodes(&self) -> usize {
        self.num_labels.map_or(0, |l| self.scores.len() / l)
    }

    /// Compute per-label AP over everything collected.
    pub fn finalize(&self) -> MetricsResult {
        let Some(num_labels) = self.num_labels else {
            return MetricsResult::from_average_precision(Vec::new(), 0);
        };
        let rows = self.num_nodes();
        let to_array = |v: &[f32]| {
            Array2::from_shape_vec((rows, num_labels), v.to_vec())
                .unwrap_or_else(|_| Array2::zeros((0, num_labels)))
        };
        let aps = average_precision_per_label(&to_array(&self.scores), &to_array(&self.targets));
        MetricsResult::from_average_precision(aps, rows)
    }

    /// Discard everything collected.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
