//! # DeepSphere Spherical U-Net
//!
//! This crate provides a U-Net for per-node segmentation of atmospheric
//! events (tropical cyclones, atmospheric rivers) on a hierarchically refined
//! spherical mesh, together with the pipeline that trains it. Convolutions
//! are Chebyshev polynomial filters of the scaled graph Laplacian of each
//! mesh level; pooling merges the children of each coarse node.
//!
//! ## Architecture
//!
//! ```text
//! MeshHierarchy ──► LevelLaplacians ──► SphericalUNet (Encoder ─► Decoder)
//!                                            ▲
//! TrainingConfig ──► Trainer ────────────────┘
//!       │               │
//!       │           DataLoader
//!       │               │
//!       │         SphereDataset (NpyDirDataset | SyntheticSphereDataset)
//!       │               │
//!       │         ChannelStats normalization
//!       │
//!       └──► losses / metrics / schedule
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use deepsphere_unet::config::TrainingConfig;
//! use deepsphere_unet::dataset::{SyntheticConfig, SyntheticSphereDataset};
//! use deepsphere_unet::graph::MeshHierarchy;
//! use deepsphere_unet::trainer::Trainer;
//!
//! let config = TrainingConfig::default();
//! config.validate().expect("config is valid");
//!
//! // Six ring levels, 12 nodes at the coarsest, four children per node.
//! let hierarchy = MeshHierarchy::synthetic(12, 4).unwrap();
//! let dataset = SyntheticSphereDataset::new(
//!     32,
//!     SyntheticConfig { num_nodes: hierarchy.input_nodes(), ..SyntheticConfig::default() },
//! );
//!
//! let trainer = Trainer::new(config);
//! let model = trainer.build_model(&hierarchy).unwrap();
//! let summary = trainer.run(&model, &dataset).unwrap();
//! println!("stopped after {} epochs: {:?}", summary.epochs_run(), summary.stop_reason);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod dataset;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod graph;
pub mod layers;
pub mod losses;
pub mod metrics;
pub mod model;
pub mod pooling;
pub mod schedule;
pub mod trainer;

// Convenient re-exports at the crate root.
pub use config::TrainingConfig;
pub use dataset::{
    DataLoader, NpyDirDataset, SphereDataset, SphereSample, SyntheticConfig, SyntheticSphereDataset,
};
pub use error::{ConfigError, DatasetError, ModelError, ModelResult, TrainError, TrainResult};
pub use graph::{LaplacianType, MeshGraph, MeshHierarchy};
pub use model::{SphericalUNet, UNetConfig};
pub use pooling::PoolingClass;
pub use trainer::{StopReason, Trainer, TrainingSummary};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
