//! Run configuration for a test-time adaptation experiment.
//!
//! [`AdaptConfig`] is the single source of truth for the adaptation target,
//! the loss strategy, the inner-loop length, dataset and checkpoint paths,
//! and device settings. It is serializable via [`serde`] so a run can be
//! described by a JSON file and overridden from the command line.
//!
//! # Example
//!
//! ```rust
//! use lan_tta::config::AdaptConfig;
//!
//! let cfg = AdaptConfig::default();
//! cfg.validate().expect("default config is valid");
//!
//! assert_eq!(cfg.inner_loop, 20);
//! assert_eq!(cfg.result_file_name(), "result_lan_zsn2n.csv");
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tch::Device;

use crate::adapter::AdaptationTarget;
use crate::error::ConfigError;
use crate::losses::LossKind;
use crate::model::ModelConfig;

/// Learning rate used when only the LAN adapter is optimised.
pub const LAN_LEARNING_RATE: f64 = 5e-4;

/// Learning rate used when the denoiser's own parameters are optimised.
pub const FINETUNE_LEARNING_RATE: f64 = 5e-6;

/// Number of optimisation steps per sample in the reference experiment.
pub const DEFAULT_INNER_LOOP: usize = 20;

// ---------------------------------------------------------------------------
// AdaptConfig
// ---------------------------------------------------------------------------

/// Complete configuration for one adaptation run.
///
/// Use [`AdaptConfig::default()`] as a starting point, then override
/// individual fields as needed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptConfig {
    // -----------------------------------------------------------------------
    // Adaptation
    // -----------------------------------------------------------------------
    /// Which parameter set is adapted: the model (`finetune`) or the LAN
    /// input adapter (`lan`). Default: **lan**.
    pub method: AdaptationTarget,

    /// Self-supervised loss strategy. Default: **zsn2n**.
    pub self_loss: LossKind,

    /// Optimisation steps per sample. One extra evaluation follows the loop,
    /// so each sample yields `inner_loop + 1` metric records. Default: **20**.
    pub inner_loop: usize,

    /// Maximum weight of the Neighbor2Neighbor regulariser, reached at the
    /// last step (the weight ramps linearly from 0). Default: **2.0**.
    pub nbr2nbr_gamma: f64,

    // -----------------------------------------------------------------------
    // Data
    // -----------------------------------------------------------------------
    /// Directory of low-quality (noisy) images.
    pub lq_dir: PathBuf,

    /// Directory of ground-truth images, file names matching `lq_dir`.
    pub gt_dir: PathBuf,

    /// Directory the result CSV is written to.
    pub output_dir: PathBuf,

    // -----------------------------------------------------------------------
    // Model
    // -----------------------------------------------------------------------
    /// Pretrained denoiser weights. A missing or unreadable file is not
    /// fatal: the model keeps its random initialisation.
    pub checkpoint_path: PathBuf,

    /// Denoiser architecture.
    pub model: ModelConfig,

    // -----------------------------------------------------------------------
    // Device
    // -----------------------------------------------------------------------
    /// Use a CUDA GPU when available. Default: **false**.
    pub use_gpu: bool,

    /// CUDA device index when `use_gpu` is `true`. Default: **0**.
    pub gpu_device_id: usize,

    // -----------------------------------------------------------------------
    // Reproducibility
    // -----------------------------------------------------------------------
    /// Base seed. Sample `i` seeds the tensor RNG with `seed + i` before its
    /// session is built. Default: **42**.
    pub seed: u64,
}

impl Default for AdaptConfig {
    fn default() -> Self {
        AdaptConfig {
            method: AdaptationTarget::Adapter,
            self_loss: LossKind::Zsn2n,
            inner_loop: DEFAULT_INNER_LOOP,
            nbr2nbr_gamma: 2.0,
            lq_dir: PathBuf::from("polyu/lq"),
            gt_dir: PathBuf::from("polyu/gt"),
            output_dir: PathBuf::from("."),
            checkpoint_path: PathBuf::from("checkpoint/real_denoising.safetensors"),
            model: ModelConfig::default(),
            use_gpu: false,
            gpu_device_id: 0,
            seed: 42,
        }
    }
}

impl AdaptConfig {
    /// Load an [`AdaptConfig`] from a JSON file at `path` and validate it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::FileRead`] if the file cannot be opened,
    /// [`ConfigError::ParseError`] if the JSON is malformed (this includes
    /// unknown `method` / `self_loss` names), and the first validation error
    /// otherwise.
    pub fn from_json(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg: AdaptConfig = serde_json::from_str(&contents).map_err(|source| {
            ConfigError::ParseError { path: path.to_path_buf(), source }
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize this configuration to pretty-printed JSON and write it to
    /// `path`, creating parent directories if necessary.
    pub fn to_json(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::FileRead {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::invalid_value("(serialization)", e.to_string()))?;
        std::fs::write(path, json).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    /// Fixed learning rate for the configured adaptation target.
    pub fn learning_rate(&self) -> f64 {
        match self.method {
            AdaptationTarget::Adapter => LAN_LEARNING_RATE,
            AdaptationTarget::Model => FINETUNE_LEARNING_RATE,
        }
    }

    /// Run label `"{method}_{self_loss}"`, used for the progress bar.
    pub fn run_label(&self) -> String {
        format!("{}_{}", self.method, self.self_loss)
    }

    /// File name of the persisted result table.
    pub fn result_file_name(&self) -> String {
        format!("result_{}.csv", self.run_label())
    }

    /// Full path of the persisted result table.
    pub fn result_path(&self) -> PathBuf {
        self.output_dir.join(self.result_file_name())
    }

    /// Resolve the compute device.
    ///
    /// Falls back to the CPU when a GPU was requested but CUDA is not
    /// available.
    pub fn device(&self) -> Device {
        if self.use_gpu && tch::Cuda::is_available() {
            Device::Cuda(self.gpu_device_id)
        } else {
            Device::Cpu
        }
    }

    /// Validate all fields and return an error describing the first problem
    /// found, or `Ok(())` if the configuration is coherent.
    ///
    /// # Validated invariants
    ///
    /// - `inner_loop` must be at least 1.
    /// - `nbr2nbr_gamma` must be finite and non-negative.
    /// - Model channels, features and depth must be non-zero, and depth must
    ///   be at least 2 (input and output convolutions).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.inner_loop == 0 {
            return Err(ConfigError::invalid_value("inner_loop", "must be > 0"));
        }
        if !self.nbr2nbr_gamma.is_finite() || self.nbr2nbr_gamma < 0.0 {
            return Err(ConfigError::invalid_value(
                "nbr2nbr_gamma",
                "must be finite and >= 0.0",
            ));
        }
        if self.model.channels == 0 {
            return Err(ConfigError::invalid_value("model.channels", "must be > 0"));
        }
        if self.model.features == 0 {
            return Err(ConfigError::invalid_value("model.features", "must be > 0"));
        }
        if self.model.depth < 2 {
            return Err(ConfigError::invalid_value("model.depth", "must be >= 2"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
