//! Spherical U-Net for per-node segmentation of climate fields on a mesh.
//!
//! # Architecture
//!
//! ```text
//! features [B, N5, 16·T]
//!       │
//!       ▼
//! ┌───────────────────────┐
//! │  Encoder (6 stages)   │  Chebyshev conv + BN + pooling, level 5 → 0
//! └───────────────────────┘
//!       │ x0  x1  x2  x3  x4   (skip pyramid)
//!       ▼
//! ┌───────────────────────┐
//! │  Decoder (5 stages)   │  unpool + concat + conv, level 0 → 5
//! └───────────────────────┘
//!       │
//!       ▼
//! logits [B, N5, L]  (softmax in inference)
//! ```
//!
//! Every parameter is registered in one `VarStore` at construction, so the
//! model can be checkpointed with [`SphericalUNet::save`] and restored with
//! [`SphericalUNet::load`] given the same hierarchy and configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tch::{nn, Device, Kind, Tensor};
use tracing::info;

use crate::decoder::Decoder;
use crate::encoder::{Encoder, SkipPyramid};
use crate::error::{ModelResult, TrainError, TrainResult};
use crate::graph::{LaplacianType, LevelLaplacians, MeshHierarchy};
use crate::pooling::{healpix_pair, PoolingClass, HEALPIX_FACTOR};

// ---------------------------------------------------------------------------
// UNetConfig
// ---------------------------------------------------------------------------

/// Architecture hyper-parameters of [`SphericalUNet`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UNetConfig {
    /// Encoder pooling reduction.
    pub pooling_class: PoolingClass,
    /// Children per coarse node.
    pub pooling_factor: usize,
    /// Number of Chebyshev terms per convolution.
    pub kernel_size: usize,
    /// Laplacian normalization shared by every level.
    pub laplacian_type: LaplacianType,
    /// Number of output labels (background included).
    pub out_channels: usize,
    /// Input frames stacked on the channel axis; `1` selects the single-frame
    /// encoder.
    pub sequence_length: usize,
}

impl Default for UNetConfig {
    fn default() -> Self {
        UNetConfig {
            pooling_class: PoolingClass::Max,
            pooling_factor: HEALPIX_FACTOR,
            kernel_size: 3,
            laplacian_type: LaplacianType::Normalized,
            out_channels: 3,
            sequence_length: 1,
        }
    }
}

// ---------------------------------------------------------------------------
// SphericalUNet
// ---------------------------------------------------------------------------

/// Complete encoder/decoder network and the `VarStore` owning its weights.
pub struct SphericalUNet {
    vs: nn::VarStore,
    encoder: Encoder,
    decoder: Decoder,
    config: UNetConfig,
}

impl SphericalUNet {
    /// Build the network for `hierarchy` on `device`.
    ///
    /// The temporal encoder is used whenever `config.sequence_length != 1`.
    ///
    /// # Errors
    ///
    /// A configuration [`ModelError`](crate::error::ModelError) when the
    /// hyper-parameters or the hierarchy are inconsistent, including
    /// `sequence_length == 0`.
    pub fn new(
        hierarchy: &MeshHierarchy,
        config: &UNetConfig,
        device: Device,
    ) -> ModelResult<Self> {
        let vs = nn::VarStore::new(device);
        let root = vs.root();
        let laplacians = LevelLaplacians::new(hierarchy, config.laplacian_type, device);
        let (pooling, unpooling) = healpix_pair(config.pooling_class, config.pooling_factor)?;

        let encoder = if config.sequence_length != 1 {
            Encoder::temporal(
                &(&root / "encoder"),
                &laplacians,
                pooling,
                config.kernel_size,
                config.sequence_length,
            )?
        } else {
            Encoder::new(&(&root / "encoder"), &laplacians, pooling, config.kernel_size)?
        };
        let decoder = Decoder::new(
            &(&root / "decoder"),
            &laplacians,
            unpooling,
            config.kernel_size,
            config.out_channels as i64,
        )?;

        let model = SphericalUNet { vs, encoder, decoder, config: config.clone() };
        info!(
            nodes = ?hierarchy.node_counts(),
            input_channels = model.input_channels(),
            labels = config.out_channels,
            parameters = model.num_parameters(),
            "built spherical U-Net"
        );
        Ok(model)
    }

    /// Forward pass with gradient tracking (training mode). Returns logits
    /// `[B, N5, L]`.
    pub fn forward_train(&self, x: &Tensor) -> ModelResult<Tensor> {
        self.forward_t(x, true)
    }

    /// Forward pass without gradient tracking (evaluation mode). Returns
    /// per-node label probabilities `[B, N5, L]`.
    pub fn forward_inference(&self, x: &Tensor) -> ModelResult<Tensor> {
        tch::no_grad(|| -> ModelResult<Tensor> {
            Ok(self.forward_t(x, false)?.softmax(2, Kind::Float))
        })
    }

    /// Raw logits; `train` selects batch-norm mode.
    pub fn forward_t(&self, x: &Tensor, train: bool) -> ModelResult<Tensor> {
        let pyramid = self.encoder.forward_t(x, train)?;
        Ok(self.decoder.forward_t(&pyramid, train))
    }

    /// Encoder output only.
    pub fn encode(&self, x: &Tensor, train: bool) -> ModelResult<SkipPyramid> {
        self.encoder.forward_t(x, train)
    }

    /// Save model weights to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> TrainResult<()> {
        self.vs
            .save(path)
            .map_err(|e| TrainError::checkpoint(format!("cannot save weights: {e}"), path))
    }

    /// Rebuild the network and load weights saved by [`SphericalUNet::save`].
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or the weights do not fit
    /// the architecture described by `hierarchy` and `config`.
    pub fn load(
        path: &Path,
        hierarchy: &MeshHierarchy,
        config: &UNetConfig,
        device: Device,
    ) -> TrainResult<Self> {
        let mut model = Self::new(hierarchy, config, device)?;
        model
            .vs
            .load(path)
            .map_err(|e| TrainError::checkpoint(format!("cannot load weights: {e}"), path))?;
        Ok(model)
    }

    /// Architecture hyper-parameters.
    pub fn config(&self) -> &UNetConfig {
        &self.config
    }

    /// Node count expected on axis 1 of the input.
    pub fn input_nodes(&self) -> i64 {
        self.encoder.input_nodes()
    }

    /// Channel count expected on axis 2 of the input.
    pub fn input_channels(&self) -> i64 {
        self.encoder.input_channels()
    }

    /// Number of output labels.
    pub fn out_channels(&self) -> i64 {
        self.decoder.out_channels()
    }

    /// Return all trainable variable tensors.
    pub fn trainable_variables(&self) -> Vec<Tensor> {
        self.vs
            .trainable_variables()
            .into_iter()
            .map(|t| t.shallow_clone())
            .collect()
    }

    /// Count total trainable parameters.
    pub fn num_parameters(&self) -> usize {
        self.vs
            .trainable_variables()
            .iter()
            .map(|t| t.numel() as usize)
            .sum()
    }

    /// Access the internal `VarStore` (e.g. to create an optimizer).
    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    /// Mutable access to the internal `VarStore`.
    pub fn var_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.vs
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
