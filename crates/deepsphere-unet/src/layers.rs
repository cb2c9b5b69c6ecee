//! Graph convolution layers and the composite blocks of the U-Net.
//!
//! All blocks operate on `[B, N, C]` tensors (batch, mesh nodes, channels)
//! and are built eagerly under an `nn::Path`, so every parameter lives in the
//! owning `VarStore` from construction onwards.
//!
//! ```text
//! SphericalGraphConv   Σ_k T_k(L̂) x · W[k] + b
//! ConvBlock            conv → batch norm (no affine) → ReLU
//! DoubleConvBlock      ConvBlock → ConvBlock
//! PoolConvBlock        pool → ConvBlock
//! PoolConv             pool → conv
//! ```

use std::sync::Arc;

use tch::{nn, nn::Module, nn::ModuleT, Tensor};

use crate::error::{ModelError, ModelResult};
use crate::graph::ChebLaplacian;
use crate::pooling::Pooling;

// ---------------------------------------------------------------------------
// SphericalGraphConv
// ---------------------------------------------------------------------------

/// Chebyshev spectral graph convolution of order `kernel_size − 1`.
///
/// ```text
/// T_0 = x
/// T_1 = L̂ x
/// T_k = 2 L̂ T_{k−1} − T_{k−2}
/// y   = Σ_{k<K} T_k · W[k] + b
/// ```
///
/// `W` has shape `[K, in, out]` with Glorot-uniform initialization per
/// order; the bias starts at zero.
#[derive(Debug)]
pub struct SphericalGraphConv {
    laplacian: ChebLaplacian,
    weight: Tensor,
    bias: Tensor,
    in_channels: i64,
    out_channels: i64,
}

impl SphericalGraphConv {
    /// Register a convolution under `path` acting on the graph of `laplacian`.
    ///
    /// # Errors
    ///
    /// [`ModelError::InvalidKernelSize`] when `kernel_size == 0`.
    pub fn new(
        path: &nn::Path,
        in_channels: i64,
        out_channels: i64,
        kernel_size: usize,
        laplacian: ChebLaplacian,
    ) -> ModelResult<Self> {
        if kernel_size == 0 {
            return Err(ModelError::InvalidKernelSize { kernel_size });
        }
        let bound = (6.0 / (in_channels + out_channels) as f64).sqrt();
        let weight = path.var(
            "weight",
            &[kernel_size as i64, in_channels, out_channels],
            nn::Init::Uniform { lo: -bound, up: bound },
        );
        let bias = path.zeros("bias", &[out_channels]);
        Ok(SphericalGraphConv { laplacian, weight, bias, in_channels, out_channels })
    }

    /// Input channel width.
    pub fn in_channels(&self) -> i64 {
        self.in_channels
    }

    /// Output channel width.
    pub fn out_channels(&self) -> i64 {
        self.out_channels
    }

    /// Number of Chebyshev terms `K`.
    pub fn kernel_size(&self) -> i64 {
        self.weight.size()[0]
    }

    /// Node count of the graph this layer is bound to.
    pub fn num_nodes(&self) -> i64 {
        self.laplacian.num_nodes()
    }
}

impl Module for SphericalGraphConv {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let k = self.kernel_size();
        let mut out = xs.matmul(&self.weight.get(0));
        if k > 1 {
            let mut prev = xs.shallow_clone();
            let mut curr = self.laplacian.propagate(xs);
            out = out + curr.matmul(&self.weight.get(1));
            for order in 2..k {
                let next = self.laplacian.propagate(&curr) * 2.0 - &prev;
                out = out + next.matmul(&self.weight.get(order));
                prev = curr;
                curr = next;
            }
        }
        out + &self.bias
    }
}

// ---------------------------------------------------------------------------
// ConvBlock
// ---------------------------------------------------------------------------

/// Graph convolution, batch normalization and ReLU.
///
/// Normalization has no learnable scale or shift and pools statistics over
/// batch and nodes jointly (the tensor is viewed as `[B·N, C]`).
#[derive(Debug)]
pub struct ConvBlock {
    conv: SphericalGraphConv,
    batchnorm: nn::BatchNorm,
}

impl ConvBlock {
    /// Register the block under `path` (`path/cheb`, `path/batchnorm`).
    pub fn new(
        path: &nn::Path,
        in_channels: i64,
        out_channels: i64,
        kernel_size: usize,
        laplacian: ChebLaplacian,
    ) -> ModelResult<Self> {
        let conv = SphericalGraphConv::new(
            &(path / "cheb"),
            in_channels,
            out_channels,
            kernel_size,
            laplacian,
        )?;
        let batchnorm = nn::batch_norm1d(
            path / "batchnorm",
            out_channels,
            nn::BatchNormConfig { affine: false, ..Default::default() },
        );
        Ok(ConvBlock { conv, batchnorm })
    }

    /// Convolution and normalization without the final ReLU.
    pub fn forward_normalized(&self, xs: &Tensor, train: bool) -> Tensor {
        let x = self.conv.forward(xs);
        let channels = x.size()[2];
        x.reshape([-1, channels]).apply_t(&self.batchnorm, train).reshape_as(&x)
    }

    /// Input channel width.
    pub fn in_channels(&self) -> i64 {
        self.conv.in_channels()
    }

    /// Output channel width.
    pub fn out_channels(&self) -> i64 {
        self.conv.out_channels()
    }
}

impl ModuleT for ConvBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        self.forward_normalized(xs, train).relu()
    }
}

// ---------------------------------------------------------------------------
// DoubleConvBlock
// ---------------------------------------------------------------------------

/// Two [`ConvBlock`]s on the same graph: `in → middle → out`.
#[derive(Debug)]
pub struct DoubleConvBlock {
    first: ConvBlock,
    second: ConvBlock,
}

impl DoubleConvBlock {
    /// Register the block under `path` (`path/block1`, `path/block2`).
    pub fn new(
        path: &nn::Path,
        in_channels: i64,
        middle_channels: i64,
        out_channels: i64,
        kernel_size: usize,
        laplacian: ChebLaplacian,
    ) -> ModelResult<Self> {
        let first = ConvBlock::new(
            &(path / "block1"),
            in_channels,
            middle_channels,
            kernel_size,
            laplacian.shallow_clone(),
        )?;
        let second =
            ConvBlock::new(&(path / "block2"), middle_channels, out_channels, kernel_size, laplacian)?;
        Ok(DoubleConvBlock { first, second })
    }

    /// Input channel width.
    pub fn in_channels(&self) -> i64 {
        self.first.in_channels()
    }

    /// Output channel width.
    pub fn out_channels(&self) -> i64 {
        self.second.out_channels()
    }
}

impl ModuleT for DoubleConvBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        self.second.forward_t(&self.first.forward_t(xs, train), train)
    }
}

// ---------------------------------------------------------------------------
// PoolConvBlock / PoolConv
// ---------------------------------------------------------------------------

/// Pooling followed by a [`ConvBlock`] on the coarser graph.
#[derive(Debug)]
pub struct PoolConvBlock {
    pooling: Arc<dyn Pooling>,
    block: ConvBlock,
}

impl PoolConvBlock {
    /// Register the block under `path`; `laplacian` is the coarse graph.
    pub fn new(
        path: &nn::Path,
        in_channels: i64,
        out_channels: i64,
        kernel_size: usize,
        laplacian: ChebLaplacian,
        pooling: Arc<dyn Pooling>,
    ) -> ModelResult<Self> {
        let block = ConvBlock::new(path, in_channels, out_channels, kernel_size, laplacian)?;
        Ok(PoolConvBlock { pooling, block })
    }

    /// Input channel width.
    pub fn in_channels(&self) -> i64 {
        self.block.in_channels()
    }

    /// Output channel width.
    pub fn out_channels(&self) -> i64 {
        self.block.out_channels()
    }
}

impl ModuleT for PoolConvBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        self.block.forward_t(&self.pooling.forward(xs), train)
    }
}

/// Pooling followed by a bare [`SphericalGraphConv`] (no normalization, no
/// activation). Used at the coarsest level.
#[derive(Debug)]
pub struct PoolConv {
    pooling: Arc<dyn Pooling>,
    conv: SphericalGraphConv,
}

impl PoolConv {
    /// Register the layer under `path` (`path/cheb`).
    pub fn new(
        path: &nn::Path,
        in_channels: i64,
        out_channels: i64,
        kernel_size: usize,
        laplacian: ChebLaplacian,
        pooling: Arc<dyn Pooling>,
    ) -> ModelResult<Self> {
        let conv =
            SphericalGraphConv::new(&(path / "cheb"), in_channels, out_channels, kernel_size, laplacian)?;
        Ok(PoolConv { pooling, conv })
    }

    /// Input channel width.
    pub fn in_channels(&self) -> i64 {
        self.conv.in_channels()
    }

    /// Output channel width.
    pub fn out_channels(&self) -> i64 {
        self.conv.out_channels()
    }
}

impl Module for PoolConv {
    fn forward(&self, xs: &Tensor) -> Tensor {
        self.conv.forward(&self.pooling.forward(xs))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
