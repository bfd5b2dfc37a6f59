//! `lan-tta` binary: runs one test-time adaptation experiment.
//!
//! # Usage
//!
//! ```bash
//! cargo run --release --bin lan-tta -- --method lan --self_loss zsn2n
//! cargo run --release --bin lan-tta -- --method finetune --self_loss nbr2nbr --cuda
//! cargo run --bin lan-tta -- --method lan --self_loss nbr2nbr --dry-run --inner-loop 5
//! ```

use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

use lan_tta::adapter::AdaptationTarget;
use lan_tta::config::AdaptConfig;
use lan_tta::dataset::{ImageFolderDataset, PairedDataset, SyntheticConfig, SyntheticPairDataset};
use lan_tta::experiment::Experiment;
use lan_tta::losses::LossKind;

/// Command-line arguments for the adaptation binary.
#[derive(Parser, Debug)]
#[command(
    name = "lan-tta",
    version,
    about = "Test-time adaptation of a pretrained denoiser",
    long_about = None
)]
struct Args {
    /// Parameters adapted per sample: the whole model or the LAN input adapter.
    #[arg(long, value_enum)]
    method: AdaptationTarget,

    /// Self-supervised loss driving the adaptation.
    #[arg(long = "self_loss", alias = "self-loss", value_enum)]
    self_loss: LossKind,

    /// Path to a JSON configuration file. Defaults are used otherwise.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the low-quality image directory.
    #[arg(long, value_name = "DIR")]
    lq_dir: Option<PathBuf>,

    /// Override the ground-truth image directory.
    #[arg(long, value_name = "DIR")]
    gt_dir: Option<PathBuf>,

    /// Override the pretrained checkpoint path.
    #[arg(long, value_name = "FILE")]
    checkpoint: Option<PathBuf>,

    /// Override the directory the result CSV is written to.
    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Override the number of optimisation steps per sample.
    #[arg(long)]
    inner_loop: Option<usize>,

    /// Run on CUDA when available (overrides config `use_gpu`).
    #[arg(long, default_value_t = false)]
    cuda: bool,

    /// Use the deterministic synthetic dataset instead of image folders.
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Number of synthetic samples when `--dry-run` is active.
    #[arg(long, default_value_t = 4)]
    dry_run_samples: usize,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() {
    let args = Args::parse();

    let log_level_filter = args
        .log_level
        .parse::<tracing_subscriber::filter::LevelFilter>()
        .unwrap_or(tracing_subscriber::filter::LevelFilter::INFO);

    tracing_subscriber::fmt()
        .with_max_level(log_level_filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    info!("LAN test-time adaptation v{}", lan_tta::VERSION);

    let mut config = match args.config.as_deref() {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            match AdaptConfig::from_json(path) {
                Ok(cfg) => cfg,
                Err(e) => {
                    error!("Failed to load configuration: {e}");
                    std::process::exit(1);
                }
            }
        }
        None => AdaptConfig::default(),
    };

    config.method = args.method;
    config.self_loss = args.self_loss;
    if let Some(dir) = args.lq_dir {
        config.lq_dir = dir;
    }
    if let Some(dir) = args.gt_dir {
        config.gt_dir = dir;
    }
    if let Some(path) = args.checkpoint {
        config.checkpoint_path = path;
    }
    if let Some(dir) = args.output_dir {
        config.output_dir = dir;
    }
    if let Some(n) = args.inner_loop {
        config.inner_loop = n;
    }
    if args.cuda {
        config.use_gpu = true;
    }

    let experiment = match Experiment::new(config) {
        Ok(exp) => exp,
        Err(e) => {
            error!("Configuration validation failed: {e}");
            std::process::exit(1);
        }
    };

    let result = if args.dry_run {
        info!("DRY RUN: using synthetic dataset ({} samples)", args.dry_run_samples);
        let syn_cfg = SyntheticConfig {
            channels: experiment.config().model.channels,
            ..SyntheticConfig::default()
        };
        let dataset = SyntheticPairDataset::new(args.dry_run_samples, syn_cfg);
        run(&experiment, &dataset)
    } else {
        let cfg = experiment.config();
        match ImageFolderDataset::discover(&cfg.lq_dir, &cfg.gt_dir) {
            Ok(dataset) => run(&experiment, &dataset),
            Err(e) => {
                error!("Failed to load dataset: {e}");
                std::process::exit(1);
            }
        }
    };

    if let Err(e) = result {
        error!("Adaptation failed: {e}");
        std::process::exit(1);
    }
}

fn run(experiment: &Experiment, dataset: &dyn PairedDataset) -> lan_tta::TtaResult<()> {
    let report = experiment.run(dataset)?;
    if let Some(table) = report.summary_table() {
        println!("{table}");
    }
    info!("Results written to {}", report.output_path.display());
    Ok(())
}
