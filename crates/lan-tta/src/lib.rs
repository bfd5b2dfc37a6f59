//! # LAN test-time adaptation
//!
//! Per-sample test-time adaptation of a pretrained image denoiser with
//! self-supervised losses. For each noisy image the crate either fine-tunes
//! the denoiser itself (`finetune`) or freezes it and learns a Learnable
//! Additive Noise input correction (`lan`), tracking PSNR/SSIM against the
//! ground truth after every step.
//!
//! ## Architecture
//!
//! ```text
//! AdaptConfig ──► Experiment ──► AdaptationLoop ──► SampleSession (per sample)
//!                     │                 │               ├─ Adapter (Lan | Identity)
//!                     │                 │               ├─ Denoiser  ◄── DenoiserFactory
//!                     │                 │               └─ Adam
//!                     │                 └─► SelfSupervisedLoss (Zsn2n | Nbr2nbr)
//!                     │
//!               PairedDataset (ImageFolderDataset | SyntheticPairDataset)
//!                     │
//!                     └─► MetricLog ──► result_{method}_{self_loss}.csv
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lan_tta::config::AdaptConfig;
//! use lan_tta::dataset::{SyntheticConfig, SyntheticPairDataset};
//! use lan_tta::experiment::Experiment;
//!
//! let mut config = AdaptConfig::default();
//! config.output_dir = "results".into();
//!
//! let dataset = SyntheticPairDataset::new(4, SyntheticConfig::default());
//! let report = Experiment::new(config).unwrap().run(&dataset).unwrap();
//! println!("{}", report.summary_table().unwrap_or_default());
//! ```

#![forbid(unsafe_code)]

pub mod adaptation;
pub mod adapter;
pub mod config;
pub mod dataset;
pub mod error;
pub mod experiment;
pub mod losses;
pub mod metrics;
pub mod model;

// Convenient re-exports at the crate root.
pub use adaptation::{AdaptationLoop, SampleSession};
pub use adapter::{AdaptationTarget, Adapter, Lan};
pub use config::AdaptConfig;
pub use dataset::{ImageFolderDataset, ImagePair, PairedDataset, SampleIter, SyntheticConfig, SyntheticPairDataset};
pub use error::{ConfigError, DatasetError, TtaError, TtaResult};
pub use experiment::{Experiment, ExperimentReport};
pub use losses::{LossKind, Nbr2nbr, SelfSupervisedLoss, Zsn2n};
pub use metrics::{MetricLog, SampleLog, StepMetrics, PSNR_IDENTICAL};
pub use model::{Denoiser, DenoiserFactory, ModelConfig};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
