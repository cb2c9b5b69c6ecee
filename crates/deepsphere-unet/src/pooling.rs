//! Mesh pooling and unpooling operators.
//!
//! Nested HEALPix orderings place the `factor` children of a coarse pixel at
//! consecutive indices, so pooling is a reshape `[B, N, C] → [B, N/f, f, C]`
//! followed by a reduction over the child axis, and unpooling repeats every
//! node `f` times.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tch::{Kind, Tensor};

use crate::error::{ModelError, ModelResult};

/// Children per coarse pixel in a nested HEALPix ordering.
pub const HEALPIX_FACTOR: usize = 4;

/// Node-count-changing operator on `[B, N, C]` tensors.
///
/// Implementations carry no learnable parameters.
pub trait Pooling: fmt::Debug + Send + Sync {
    /// Map `[B, N_in, C]` to `[B, N_out, C]`.
    fn forward(&self, x: &Tensor) -> Tensor;

    /// `N_out` for `input_nodes`, or `None` when the operator cannot apply.
    fn output_nodes(&self, input_nodes: usize) -> Option<usize>;

    /// Grouping factor between the two resolutions.
    fn factor(&self) -> usize;
}

/// Reduction used by [`HealpixPooling`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolingClass {
    /// Keep the largest child value per channel.
    #[default]
    Max,
    /// Average the children per channel.
    Average,
}

impl fmt::Display for PoolingClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolingClass::Max => f.write_str("max"),
            PoolingClass::Average => f.write_str("average"),
        }
    }
}

fn check_factor(factor: usize) -> ModelResult<()> {
    if factor < 2 {
        return Err(ModelError::InvalidPoolingFactor { factor });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// HealpixPooling
// ---------------------------------------------------------------------------

/// Reduce groups of `factor` consecutive nodes to one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealpixPooling {
    factor: usize,
    class: PoolingClass,
}

impl HealpixPooling {
    /// Pooling with an explicit factor and reduction.
    pub fn new(factor: usize, class: PoolingClass) -> ModelResult<Self> {
        check_factor(factor)?;
        Ok(HealpixPooling { factor, class })
    }

    /// Reduction this operator applies.
    pub fn class(&self) -> PoolingClass {
        self.class
    }
}

impl Pooling for HealpixPooling {
    fn forward(&self, x: &Tensor) -> Tensor {
        let shape = x.size();
        let f = self.factor as i64;
        let grouped = x.reshape([shape[0], shape[1] / f, f, shape[2]]);
        match self.class {
            PoolingClass::Max => grouped.max_dim(2, false).0,
            PoolingClass::Average => grouped.mean_dim(&[2_i64][..], false, Kind::Float),
        }
    }

    fn output_nodes(&self, input_nodes: usize) -> Option<usize> {
        (input_nodes % self.factor == 0 && input_nodes >= self.factor)
            .then(|| input_nodes / self.factor)
    }

    fn factor(&self) -> usize {
        self.factor
    }
}

// ---------------------------------------------------------------------------
// HealpixUnpooling
// ---------------------------------------------------------------------------

/// Repeat every node `factor` times (nearest-neighbour upsampling).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealpixUnpooling {
    factor: usize,
}

impl HealpixUnpooling {
    /// Unpooling by `factor`.
    pub fn new(factor: usize) -> ModelResult<Self> {
        check_factor(factor)?;
        Ok(HealpixUnpooling { factor })
    }
}

impl Pooling for HealpixUnpooling {
    fn forward(&self, x: &Tensor) -> Tensor {
        let shape = x.size();
        let f = self.factor as i64;
        x.unsqueeze(2)
            .expand([shape[0], shape[1], f, shape[2]], false)
            .reshape([shape[0], shape[1] * f, shape[2]])
    }

    fn output_nodes(&self, input_nodes: usize) -> Option<usize> {
        input_nodes.checked_mul(self.factor)
    }

    fn factor(&self) -> usize {
        self.factor
    }
}

/// Matching `(pooling, unpooling)` pair for the U-Net.
pub fn healpix_pair(
    class: PoolingClass,
    factor: usize,
) -> ModelResult<(Arc<dyn Pooling>, Arc<dyn Pooling>)> {
    Ok((
        Arc::new(HealpixPooling::new(factor, class)?),
        Arc::new(HealpixUnpooling::new(factor)?),
    ))
}

/// Check that `pooling` maps `finer_nodes` onto the `nodes` of `level`.
pub(crate) fn check_pooling(
    pooling: &dyn Pooling,
    level: usize,
    finer_nodes: usize,
    nodes: usize,
) -> ModelResult<()> {
    if pooling.output_nodes(finer_nodes) != Some(nodes) {
        return Err(ModelError::PoolingIncompatible {
            level,
            nodes,
            finer_nodes,
            factor: pooling.factor(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp() -> Tensor {
        // [1, 8, 1] holding 0..8
        Tensor::arange(8, (Kind::Float, tch::Device::Cpu)).view([1, 8, 1])
    }

    #[test]
    fn max_pooling_keeps_group_maximum() {
        let pool = HealpixPooling::new(4, PoolingClass::Max).unwrap();
        let y = pool.forward(&ramp());
        assert_eq!(y.size(), vec![1, 2, 1]);
        assert_eq!(y.double_value(&[0, 0, 0]), 3.0);
        assert_eq!(y.double_value(&[0, 1, 0]), 7.0);
    }

    #[test]
    fn average_pooling_takes_group_mean() {
        let pool = HealpixPooling::new(4, PoolingClass::Average).unwrap();
        let y = pool.forward(&ramp());
        assert!((y.double_value(&[0, 0, 0]) - 1.5).abs() < 1e-6);
        assert!((y.double_value(&[0, 1, 0]) - 5.5).abs() < 1e-6);
    }

    #[test]
    fn unpooling_repeats_nodes() {
        let unpool = HealpixUnpooling::new(2).unwrap();
        let x = Tensor::from_slice(&[1.0_f32, 2.0, 10.0, 20.0]).view([1, 2, 2]);
        let y = unpool.forward(&x);
        assert_eq!(y.size(), vec![1, 4, 2]);
        assert_eq!(y.double_value(&[0, 1, 0]), 1.0);
        assert_eq!(y.double_value(&[0, 2, 1]), 20.0);
    }

    #[test]
    fn output_nodes_requires_divisibility() {
        let pool = HealpixPooling::new(4, PoolingClass::Max).unwrap();
        assert_eq!(pool.output_nodes(48), Some(12));
        assert_eq!(pool.output_nodes(10), None);
        assert_eq!(pool.output_nodes(0), None);
        assert!(HealpixPooling::new(1, PoolingClass::Max).is_err());
    }
}
