//! Node-wise cross-entropy for spherical segmentation.
//!
//! Logits `[B, N, L]` are flattened to `[B·N, L]` and compared against the
//! arg-max of the label vectors, so one-hot and soft labels are both
//! accepted. Optional per-label weights rebalance rare events against the
//! background class:
//!
//! ```text
//! L = Σᵢ w[yᵢ] · −log softmax(zᵢ)[yᵢ]  /  Σᵢ w[yᵢ]
//! ```

use tch::{Kind, Reduction, Tensor};

use crate::error::{ModelError, ModelResult};

// ─────────────────────────────────────────────────────────────────────────────
// NodeCrossEntropy
// ─────────────────────────────────────────────────────────────────────────────

/// Cross-entropy averaged over every node of every sample in a batch.
#[derive(Debug)]
pub struct NodeCrossEntropy {
    weight: Option<Tensor>,
}

impl NodeCrossEntropy {
    /// Unweighted loss.
    pub fn new() -> Self {
        NodeCrossEntropy { weight: None }
    }

    /// Loss with one weight per label.
    pub fn weighted(weights: &[f32]) -> Self {
        NodeCrossEntropy { weight: Some(Tensor::from_slice(weights)) }
    }

    /// Build from an optional weight list, as stored in the training config.
    pub fn from_weights(weights: Option<&[f32]>) -> Self {
        weights.map_or_else(Self::new, Self::weighted)
    }

    /// Per-label weights, if any.
    pub fn weight(&self) -> Option<&Tensor> {
        self.weight.as_ref()
    }

    /// Scalar loss of `logits` `[B, N, L]` against `labels` `[B, N, L]`.
    ///
    /// # Errors
    ///
    /// [`ModelError::ShapeMismatch`] when the two tensors differ in shape or
    /// the label count disagrees with the configured weights.
    pub fn forward(&self, logits: &Tensor, labels: &Tensor) -> ModelResult<Tensor> {
        let size = logits.size();
        if size.len() != 3 {
            return Err(ModelError::InputRank { shape: size });
        }
        let label_size = labels.size();
        for (dim, (name, expected)) in ["batch", "nodes", "labels"].iter().zip(&size).enumerate() {
            let actual = label_size.get(dim).copied().unwrap_or(0);
            if actual != *expected {
                return Err(ModelError::shape_mismatch(*name, *expected, actual));
            }
        }
        let num_labels = size[2];
        if let Some(w) = &self.weight {
            let count = w.size()[0];
            if count != num_labels {
                return Err(ModelError::shape_mismatch("class weights", num_labels, count));
            }
        }

        let flat_logits = logits.reshape([-1, num_labels]);
        let target = labels.reshape([-1, num_labels]).argmax(1, false).to_kind(Kind::Int64);
        let weight = self.weight.as_ref().map(|w| w.to_device(logits.device()));
        Ok(flat_logits.cross_entropy_loss::<Tensor>(
            &target,
            weight,
            Reduction::Mean,
            -100,
            0.0,
        ))
    }
}

impl Default for NodeCrossEntropy {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    fn one_hot(classes: &[i64], num_labels: i64) -> Tensor {
        let n = classes.len() as i64;
        Tensor::from_slice(classes)
            .one_hot(num_labels)
            .to_kind(Kind::Float)
            .reshape([1, n, num_labels])
    }

    #[test]
    fn uniform_logits_give_log_num_labels() {
        let logits = Tensor::zeros([2, 5, 3], (Kind::Float, Device::Cpu));
        let labels = one_hot(&[0, 1, 2, 0, 1, 2, 0, 1, 2, 0], 3).reshape([2, 5, 3]);
        let loss = NodeCrossEntropy::new().forward(&logits, &labels).unwrap();
        let v = loss.double_value(&[]);
        assert!((v - 3f64.ln()).abs() < 1e-5, "loss = {v}");
    }

    #[test]
    fn confident_correct_logits_give_small_loss() {
        let labels = one_hot(&[0, 2, 1, 2], 3);
        let logits = &labels * 20.0;
        let loss = NodeCrossEntropy::new().forward(&logits, &labels).unwrap();
        assert!(loss.double_value(&[]) < 1e-6);
    }

    #[test]
    fn weights_shift_the_average() {
        // Node 0 is predicted correctly, node 1 is not.
        let labels = one_hot(&[0, 1], 2);
        let logits = Tensor::from_slice(&[5.0f32, 0.0, 5.0, 0.0]).reshape([1, 2, 2]);
        let plain = NodeCrossEntropy::new().forward(&logits, &labels).unwrap().double_value(&[]);
        let heavy = NodeCrossEntropy::weighted(&[1.0, 10.0])
            .forward(&logits, &labels)
            .unwrap()
            .double_value(&[]);
        assert!(heavy > plain);
    }

    #[test]
    fn mismatched_shapes_are_rejected() {
        let logits = Tensor::zeros([1, 4, 3], (Kind::Float, Device::Cpu));
        let labels = Tensor::zeros([1, 5, 3], (Kind::Float, Device::Cpu));
        let err = NodeCrossEntropy::new().forward(&logits, &labels).unwrap_err();
        assert!(err.is_shape_mismatch());

        let labels = Tensor::zeros([1, 4, 3], (Kind::Float, Device::Cpu));
        let err = NodeCrossEntropy::weighted(&[1.0, 1.0]).forward(&logits, &labels).unwrap_err();
        assert!(err.is_shape_mismatch());
    }

    #[test]
    fn loss_is_differentiable() {
        let logits = Tensor::randn([1, 6, 3], (Kind::Float, Device::Cpu)).set_requires_grad(true);
        let labels = one_hot(&[0, 1, 2, 2, 1, 0], 3);
        let loss = NodeCrossEntropy::new().forward(&logits, &labels).unwrap();
        loss.backward();
        assert_eq!(logits.grad().size(), vec![1, 6, 3]);
    }
}
