//! `train` binary: entry point for Spherical U-Net training.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin train -- --config config.json --graphs mesh.json
//! cargo run --bin train -- --config config.json --graphs mesh.json --cuda
//! cargo run --bin train -- --dry-run
//! ```

use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

use deepsphere_unet::config::TrainingConfig;
use deepsphere_unet::dataset::{NpyDirDataset, SphereDataset, SyntheticConfig, SyntheticSphereDataset};
use deepsphere_unet::graph::MeshHierarchy;
use deepsphere_unet::trainer::Trainer;

/// Coarsest node count of the synthetic hierarchy used by `--dry-run`.
const DRY_RUN_COARSEST_NODES: usize = 12;

/// Command-line arguments for the training binary.
#[derive(Parser, Debug)]
#[command(
    name = "train",
    version,
    about = "Spherical U-Net training pipeline",
    long_about = None
)]
struct Args {
    /// Path to the JSON configuration file.
    ///
    /// If not provided, the default `TrainingConfig` is used.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Mesh hierarchy JSON (overrides config `graph_path`).
    #[arg(long, value_name = "FILE")]
    graphs: Option<PathBuf>,

    /// Override the data directory from the config.
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Override the checkpoint directory from the config.
    #[arg(long, value_name = "DIR")]
    checkpoint_dir: Option<PathBuf>,

    /// Enable CUDA training (overrides config `use_gpu`).
    #[arg(long, default_value_t = false)]
    cuda: bool,

    /// Use a synthetic mesh and dataset instead of real data.
    ///
    /// This is intended for pipeline smoke-tests only, not production training.
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Number of synthetic samples when `--dry-run` is active.
    #[arg(long, default_value_t = 16)]
    dry_run_samples: usize,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() {
    let args = Args::parse();

    // Initialise tracing subscriber.
    let log_level_filter = args
        .log_level
        .parse::<tracing_subscriber::filter::LevelFilter>()
        .unwrap_or(tracing_subscriber::filter::LevelFilter::INFO);

    tracing_subscriber::fmt()
        .with_max_level(log_level_filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    info!("DeepSphere Spherical U-Net training v{}", deepsphere_unet::VERSION);

    // Load or construct training configuration.
    let mut config = match args.config.as_deref() {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            match TrainingConfig::from_json(path) {
                Ok(cfg) => cfg,
                Err(e) => {
                    error!("Failed to load configuration: {e}");
                    std::process::exit(1);
                }
            }
        }
        None => {
            info!("No configuration file provided; using defaults");
            TrainingConfig::default()
        }
    };

    // Apply CLI overrides.
    if let Some(path) = args.graphs {
        config.graph_path = Some(path);
    }
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    if let Some(dir) = args.checkpoint_dir {
        config.model_save_dir = dir;
    }
    if args.cuda {
        config.use_gpu = true;
    }

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {e}");
        std::process::exit(1);
    }

    info!("Configuration validated successfully");
    info!("  input channels: {}", config.input_channels());
    info!("  labels        : {}", config.model.out_channels);
    info!("  kernel size   : {}", config.model.kernel_size);
    info!("  laplacian     : {}", config.model.laplacian_type);
    info!("  pooling       : {} / {}", config.model.pooling_class, config.model.pooling_factor);
    info!("  batch size    : {}", config.batch_size);
    info!("  epochs        : {}", config.n_epochs);
    info!("  device        : {}", if config.use_gpu { "GPU" } else { "CPU" });

    if args.dry_run {
        info!("DRY RUN: synthetic mesh and dataset ({} samples)", args.dry_run_samples);
        let hierarchy =
            match MeshHierarchy::synthetic(DRY_RUN_COARSEST_NODES, config.model.pooling_factor) {
                Ok(h) => h,
                Err(e) => {
                    error!("Failed to build synthetic mesh: {e}");
                    std::process::exit(1);
                }
            };
        let syn_cfg = SyntheticConfig {
            num_nodes: hierarchy.input_nodes(),
            num_channels: config.input_channels(),
            num_labels: config.model.out_channels,
        };
        let dataset = SyntheticSphereDataset::new(args.dry_run_samples, syn_cfg);
        run_trainer(config, &hierarchy, &dataset);
    } else {
        let Some(graph_path) = config.graph_path.clone() else {
            error!("No mesh hierarchy given; pass --graphs or set graph_path");
            std::process::exit(1);
        };
        let hierarchy = match MeshHierarchy::from_json(&graph_path) {
            Ok(h) => h,
            Err(e) => {
                error!("Failed to load mesh hierarchy: {e}");
                std::process::exit(1);
            }
        };

        info!("Loading samples from {}", config.data_dir.display());
        let dataset = match NpyDirDataset::discover(&config.data_dir) {
            Ok(ds) => ds,
            Err(e) => {
                error!("Failed to load dataset: {e}");
                std::process::exit(1);
            }
        };
        if dataset.is_empty() {
            error!("Dataset is empty; no samples were found in {}", config.data_dir.display());
            std::process::exit(1);
        }
        run_trainer(config, &hierarchy, &dataset);
    }
}

/// Build the model and run the training loop on `dataset`.
fn run_trainer(config: TrainingConfig, hierarchy: &MeshHierarchy, dataset: &dyn SphereDataset) {
    info!("Dataset: {} ({} samples)", dataset.name(), dataset.len());
    let trainer = Trainer::new(config);
    let model = match trainer.build_model(hierarchy) {
        Ok(m) => m,
        Err(e) => {
            error!("Failed to build model: {e}");
            std::process::exit(1);
        }
    };

    match trainer.run(&model, dataset) {
        Ok(summary) => {
            info!(
                "Training finished after {} epochs ({:?}); weights at {}",
                summary.epochs_run(),
                summary.stop_reason,
                summary.checkpoint_path.display()
            );
            if let Some(metrics) = summary.last_metrics() {
                info!("Final validation: {}", metrics.summary());
            }
        }
        Err(e) => {
            error!("Training failed: {e}");
            std::process::exit(1);
        }
    }
}
