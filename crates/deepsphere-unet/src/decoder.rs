//! Decoder half of the Spherical U-Net.
//!
//! ```text
//! x0 [N0, 512] ─ unpool ─ ConvBlock 512→512 ─ ⊕ x1 ─ ConvBlock 1024→512 ─┐
//!   ┌───────────────────────────────────────────────────────────────────┘
//!   └ unpool ─ ConvBlock 512→256 ─ ⊕ x2 ─ ConvBlock 768→256 ─┐
//!   ┌────────────────────────────────────────────────────────┘
//!   └ unpool ─ ConvBlock 256→128 ─ ⊕ x3 ─ ConvBlock 384→128 ─┐
//!   ┌────────────────────────────────────────────────────────┘
//!   └ unpool ─ ConvBlock 128→64  ─ ⊕ x4 ─ ConvBlock 192→64 ──┐
//!   ┌────────────────────────────────────────────────────────┘
//!   └ unpool ─ ConvBlock 64→32 ─ conv 32→L ─► logits [N5, L]
//! ```
//!
//! `⊕` concatenates along the channel axis.

use std::sync::Arc;

use tch::{nn, nn::Module, nn::ModuleT, Tensor};

use crate::encoder::SkipPyramid;
use crate::error::{ModelError, ModelResult};
use crate::graph::{ChebLaplacian, LevelLaplacians, NUM_LEVELS};
use crate::layers::{ConvBlock, SphericalGraphConv};
use crate::pooling::{check_pooling, Pooling};

/// Unpool, convolve, concatenate a skip tensor, convolve again.
///
/// The skip tensor is expected to carry `in_channels` channels.
#[derive(Debug)]
pub struct UnpoolConcatBlock {
    unpooling: Arc<dyn Pooling>,
    up: ConvBlock,
    fuse: ConvBlock,
}

impl UnpoolConcatBlock {
    /// Register the block under `path`; `laplacian` is the finer graph.
    pub fn new(
        path: &nn::Path,
        in_channels: i64,
        out_channels: i64,
        kernel_size: usize,
        laplacian: ChebLaplacian,
        unpooling: Arc<dyn Pooling>,
    ) -> ModelResult<Self> {
        let up = ConvBlock::new(
            &(path / "up"),
            in_channels,
            out_channels,
            kernel_size,
            laplacian.shallow_clone(),
        )?;
        let fuse = ConvBlock::new(
            &(path / "fuse"),
            in_channels + out_channels,
            out_channels,
            kernel_size,
            laplacian,
        )?;
        Ok(UnpoolConcatBlock { unpooling, up, fuse })
    }

    /// Decode `x` at the coarser level using `skip` from the finer level.
    pub fn forward_t(&self, x: &Tensor, skip: &Tensor, train: bool) -> Tensor {
        let x = self.up.forward_t(&self.unpooling.forward(x), train);
        Tensor::cat(&[&x, skip], 2).apply_t(&self.fuse, train)
    }
}

/// Final unpool, conv block and output convolution producing logits.
#[derive(Debug)]
pub struct UnpoolHeadBlock {
    unpooling: Arc<dyn Pooling>,
    block: ConvBlock,
    head: SphericalGraphConv,
}

impl UnpoolHeadBlock {
    /// Register the head under `path` (`path/block`, `path/head`).
    pub fn new(
        path: &nn::Path,
        in_channels: i64,
        middle_channels: i64,
        out_channels: i64,
        kernel_size: usize,
        laplacian: ChebLaplacian,
        unpooling: Arc<dyn Pooling>,
    ) -> ModelResult<Self> {
        let block = ConvBlock::new(
            &(path / "block"),
            in_channels,
            middle_channels,
            kernel_size,
            laplacian.shallow_clone(),
        )?;
        let head = SphericalGraphConv::new(
            &(path / "head"),
            middle_channels,
            out_channels,
            kernel_size,
            laplacian,
        )?;
        Ok(UnpoolHeadBlock { unpooling, block, head })
    }
}

impl ModuleT for UnpoolHeadBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        self.head.forward(&self.block.forward_t(&self.unpooling.forward(xs), train))
    }
}

/// Mirror of the encoder mapping a [`SkipPyramid`] to per-node logits.
#[derive(Debug)]
pub struct Decoder {
    dec_l1: UnpoolConcatBlock,
    dec_l2: UnpoolConcatBlock,
    dec_l3: UnpoolConcatBlock,
    dec_l4: UnpoolConcatBlock,
    dec_l5: UnpoolHeadBlock,
    out_channels: i64,
}

impl Decoder {
    /// Build the decoder for `out_channels` labels.
    ///
    /// # Errors
    ///
    /// A configuration [`ModelError`] when `unpooling` does not map each
    /// level onto the next finer one, when `out_channels < 1` or when
    /// `kernel_size == 0`.
    pub fn new(
        path: &nn::Path,
        laplacians: &LevelLaplacians,
        unpooling: Arc<dyn Pooling>,
        kernel_size: usize,
        out_channels: i64,
    ) -> ModelResult<Self> {
        let nodes = laplacians.node_counts();
        for level in 1..NUM_LEVELS {
            check_pooling(unpooling.as_ref(), level, nodes[level - 1], nodes[level])?;
        }
        if out_channels < 1 {
            return Err(ModelError::InvalidOutputChannels { out_channels });
        }

        let concat = |level: usize, in_channels: i64, out: i64| {
            UnpoolConcatBlock::new(
                &(path / format!("dec_l{level}")),
                in_channels,
                out,
                kernel_size,
                laplacians.level(level),
                Arc::clone(&unpooling),
            )
        };
        Ok(Decoder {
            dec_l1: concat(1, 512, 512)?,
            dec_l2: concat(2, 512, 256)?,
            dec_l3: concat(3, 256, 128)?,
            dec_l4: concat(4, 128, 64)?,
            dec_l5: UnpoolHeadBlock::new(
                &(path / "dec_l5"),
                64,
                32,
                out_channels,
                kernel_size,
                laplacians.level(5),
                Arc::clone(&unpooling),
            )?,
            out_channels,
        })
    }

    /// Number of output labels.
    pub fn out_channels(&self) -> i64 {
        self.out_channels
    }

    /// Decode a pyramid into logits `[B, N5, L]`.
    pub fn forward_t(&self, pyramid: &SkipPyramid, train: bool) -> Tensor {
        let x = self.dec_l1.forward_t(&pyramid.x0, &pyramid.x1, train);
        let x = self.dec_l2.forward_t(&x, &pyramid.x2, train);
        let x = self.dec_l3.forward_t(&x, &pyramid.x3, train);
        let x = self.dec_l4.forward_t(&x, &pyramid.x4, train);
        self.dec_l5.forward_t(&x, train)
    }
}
