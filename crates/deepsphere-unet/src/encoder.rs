//! Six-stage encoder of the Spherical U-Net.
//!
//! ```text
//! level 5  [B, N5, 16]  ─ DoubleConvBlock 16→32→64 ──► [B, N5, 64]  (not kept)
//! level 4               ─ pool ─ ConvBlock 64→128 ───► x4 [B, N4, 128]
//! level 3               ─ pool ─ ConvBlock 128→256 ──► x3 [B, N3, 256]
//! level 2               ─ pool ─ ConvBlock 256→512 ──► x2 [B, N2, 512]
//! level 1               ─ pool ─ ConvBlock 512→512 ──► x1 [B, N1, 512]
//! level 0               ─ pool ─ conv 512→512 ───────► x0 [B, N0, 512]
//! ```
//!
//! The level-0 stage has no normalization and no activation.
//!
//! The temporal variant folds a sequence of `T` input frames into the channel
//! axis (`16·T` input channels) and replaces the first stage with a
//! `16T→16T→64` double block; every later stage is unchanged.

use std::sync::Arc;

use tch::{nn, nn::Module, nn::ModuleT, Tensor};
use tracing::debug;

use crate::error::{ModelError, ModelResult};
use crate::graph::{LevelLaplacians, NUM_LEVELS};
use crate::layers::{DoubleConvBlock, PoolConv, PoolConvBlock};
use crate::pooling::{check_pooling, Pooling};

/// Channels per input frame.
pub const INPUT_CHANNELS: i64 = 16;

/// Channel width of the returned pyramid, level 0 first (`x0 … x4`).
pub const PYRAMID_CHANNELS: [i64; 5] = [512, 512, 512, 256, 128];

// ---------------------------------------------------------------------------
// Stage descriptors
// ---------------------------------------------------------------------------

/// Layer kind of one encoder stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    /// Two conv blocks on the stage graph, no pooling.
    DoubleConv {
        /// Width between the two blocks.
        middle_channels: i64,
    },
    /// Pool, then conv + batch norm + ReLU.
    PoolConvBlock,
    /// Pool, then a bare conv.
    PoolConv,
}

/// Shape of one encoder stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageSpec {
    /// Mesh level the stage runs on (5 = input resolution).
    pub level: usize,
    /// Input channel width.
    pub in_channels: i64,
    /// Output channel width.
    pub out_channels: i64,
    /// Layer kind.
    pub kind: StageKind,
}

impl StageSpec {
    const fn pooled(level: usize, in_channels: i64, out_channels: i64) -> Self {
        StageSpec { level, in_channels, out_channels, kind: StageKind::PoolConvBlock }
    }

    /// Stages of the single-frame encoder, finest first.
    pub fn standard() -> [StageSpec; NUM_LEVELS] {
        Self::with_first(StageSpec {
            level: 5,
            in_channels: INPUT_CHANNELS,
            out_channels: 64,
            kind: StageKind::DoubleConv { middle_channels: 32 },
        })
    }

    /// Stages of the temporal encoder for `sequence_length` frames.
    ///
    /// # Errors
    ///
    /// [`ModelError::InvalidSequenceLength`] when `sequence_length == 0`.
    pub fn temporal(sequence_length: usize) -> ModelResult<[StageSpec; NUM_LEVELS]> {
        if sequence_length == 0 {
            return Err(ModelError::InvalidSequenceLength { sequence_length });
        }
        let width = INPUT_CHANNELS * sequence_length as i64;
        Ok(Self::with_first(StageSpec {
            level: 5,
            in_channels: width,
            out_channels: 64,
            kind: StageKind::DoubleConv { middle_channels: width },
        }))
    }

    fn with_first(first: StageSpec) -> [StageSpec; NUM_LEVELS] {
        [
            first,
            Self::pooled(4, 64, 128),
            Self::pooled(3, 128, 256),
            Self::pooled(2, 256, 512),
            Self::pooled(1, 512, 512),
            StageSpec { level: 0, in_channels: 512, out_channels: 512, kind: StageKind::PoolConv },
        ]
    }
}

// ---------------------------------------------------------------------------
// Stage modules
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum EncoderStage {
    Double(DoubleConvBlock),
    Pooled(PoolConvBlock),
    Coarsest(PoolConv),
}

impl EncoderStage {
    fn build(
        path: &nn::Path,
        spec: &StageSpec,
        laplacians: &LevelLaplacians,
        pooling: &Arc<dyn Pooling>,
        kernel_size: usize,
    ) -> ModelResult<Self> {
        let path = path / format!("enc_l{}", spec.level);
        let laplacian = laplacians.level(spec.level);
        let stage = match spec.kind {
            StageKind::DoubleConv { middle_channels } => EncoderStage::Double(DoubleConvBlock::new(
                &path,
                spec.in_channels,
                middle_channels,
                spec.out_channels,
                kernel_size,
                laplacian,
            )?),
            StageKind::PoolConvBlock => EncoderStage::Pooled(PoolConvBlock::new(
                &path,
                spec.in_channels,
                spec.out_channels,
                kernel_size,
                laplacian,
                Arc::clone(pooling),
            )?),
            StageKind::PoolConv => EncoderStage::Coarsest(PoolConv::new(
                &path,
                spec.in_channels,
                spec.out_channels,
                kernel_size,
                laplacian,
                Arc::clone(pooling),
            )?),
        };
        Ok(stage)
    }
}

impl ModuleT for EncoderStage {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        match self {
            EncoderStage::Double(block) => block.forward_t(xs, train),
            EncoderStage::Pooled(block) => block.forward_t(xs, train),
            EncoderStage::Coarsest(layer) => layer.forward(xs),
        }
    }
}

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

/// Multi-resolution features returned by [`Encoder::forward_t`].
#[derive(Debug)]
pub struct SkipPyramid {
    /// Level 0, `[B, N0, 512]`.
    pub x0: Tensor,
    /// Level 1, `[B, N1, 512]`.
    pub x1: Tensor,
    /// Level 2, `[B, N2, 512]`.
    pub x2: Tensor,
    /// Level 3, `[B, N3, 256]`.
    pub x3: Tensor,
    /// Level 4, `[B, N4, 128]`.
    pub x4: Tensor,
}

impl SkipPyramid {
    /// The five tensors, level 0 first.
    pub fn levels(&self) -> [&Tensor; 5] {
        [&self.x0, &self.x1, &self.x2, &self.x3, &self.x4]
    }
}

/// Encoder producing a [`SkipPyramid`] from `[B, N5, C_in]` features.
#[derive(Debug)]
pub struct Encoder {
    stages: [EncoderStage; NUM_LEVELS],
    specs: [StageSpec; NUM_LEVELS],
    input_nodes: i64,
}

impl Encoder {
    /// Single-frame encoder (`16` input channels).
    pub fn new(
        path: &nn::Path,
        laplacians: &LevelLaplacians,
        pooling: Arc<dyn Pooling>,
        kernel_size: usize,
    ) -> ModelResult<Self> {
        Self::from_stages(path, StageSpec::standard(), laplacians, pooling, kernel_size)
    }

    /// Temporal encoder over `sequence_length` frames (`16·T` input channels).
    pub fn temporal(
        path: &nn::Path,
        laplacians: &LevelLaplacians,
        pooling: Arc<dyn Pooling>,
        kernel_size: usize,
        sequence_length: usize,
    ) -> ModelResult<Self> {
        let specs = StageSpec::temporal(sequence_length)?;
        Self::from_stages(path, specs, laplacians, pooling, kernel_size)
    }

    /// Build an encoder from explicit stage descriptors, finest first.
    ///
    /// Checks that channel widths chain from stage to stage and that
    /// `pooling` maps each level's node count onto the next coarser one.
    ///
    /// # Panics
    ///
    /// Panics if a descriptor names a level `>= 6`.
    pub fn from_stages(
        path: &nn::Path,
        specs: [StageSpec; NUM_LEVELS],
        laplacians: &LevelLaplacians,
        pooling: Arc<dyn Pooling>,
        kernel_size: usize,
    ) -> ModelResult<Self> {
        if kernel_size == 0 {
            return Err(ModelError::InvalidKernelSize { kernel_size });
        }
        let node_counts = laplacians.node_counts();
        for pair in specs.windows(2) {
            let (prev, spec) = (&pair[0], &pair[1]);
            if spec.in_channels != prev.out_channels {
                return Err(ModelError::StageChannels {
                    level: spec.level,
                    expected: spec.in_channels,
                    found: prev.out_channels,
                });
            }
            if !matches!(spec.kind, StageKind::DoubleConv { .. }) {
                check_pooling(
                    pooling.as_ref(),
                    spec.level,
                    node_counts[prev.level],
                    node_counts[spec.level],
                )?;
            }
        }

        let built = specs
            .iter()
            .map(|spec| EncoderStage::build(path, spec, laplacians, &pooling, kernel_size))
            .collect::<ModelResult<Vec<_>>>()?;
        let stages: [EncoderStage; NUM_LEVELS] =
            built.try_into().map_err(|v: Vec<EncoderStage>| ModelError::LevelCount {
                list: "stages",
                expected: NUM_LEVELS,
                found: v.len(),
            })?;

        let input_nodes = node_counts[specs[0].level] as i64;
        debug!(
            input_nodes,
            input_channels = specs[0].in_channels,
            kernel_size,
            "built spherical encoder"
        );
        Ok(Encoder { stages, specs, input_nodes })
    }

    /// Node count expected on axis 1 of the input.
    pub fn input_nodes(&self) -> i64 {
        self.input_nodes
    }

    /// Channel count expected on axis 2 of the input.
    pub fn input_channels(&self) -> i64 {
        self.specs[0].in_channels
    }

    /// Stage descriptors, finest first.
    pub fn stages(&self) -> &[StageSpec; NUM_LEVELS] {
        &self.specs
    }

    /// Run the encoder on `x: [B, N5, C_in]`.
    ///
    /// `train` selects batch statistics (and updates running estimates) in
    /// batch normalization; otherwise running estimates are used.
    ///
    /// # Errors
    ///
    /// A shape-mismatch [`ModelError`] when `x` is not rank 3 or its node or
    /// channel axis does not match the encoder.
    pub fn forward_t(&self, x: &Tensor, train: bool) -> ModelResult<SkipPyramid> {
        let shape = x.size();
        if shape.len() != 3 {
            return Err(ModelError::InputRank { shape });
        }
        if shape[1] != self.input_nodes {
            return Err(ModelError::shape_mismatch("nodes", self.input_nodes, shape[1]));
        }
        if shape[2] != self.input_channels() {
            return Err(ModelError::shape_mismatch("channels", self.input_channels(), shape[2]));
        }

        let [l5, l4, l3, l2, l1, l0] = &self.stages;
        let x5 = l5.forward_t(x, train);
        let x4 = l4.forward_t(&x5, train);
        let x3 = l3.forward_t(&x4, train);
        let x2 = l2.forward_t(&x3, train);
        let x1 = l1.forward_t(&x2, train);
        let x0 = l0.forward_t(&x1, train);
        Ok(SkipPyramid { x0, x1, x2, x3, x4 })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
