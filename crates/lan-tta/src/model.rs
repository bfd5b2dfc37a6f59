//! Residual convolutional image denoiser using tch-rs (PyTorch Rust bindings).
//!
//! # Architecture
//!
//! ```text
//! noisy x [B, C, H, W]
//!       │
//!       ├──────────────────────────────┐
//!       ▼                              │
//! ┌──────────────────────────┐         │
//! │ Conv3x3(C→F) + ReLU      │         │
//! │ (depth-2) × Conv3x3(F→F) │         │
//! │            + ReLU        │         │
//! │ Conv3x3(F→C)             │         │
//! └──────────────────────────┘         │
//!       │ residual r(x)                │
//!       ▼                              ▼
//!                x − r(x)   (clean estimate)
//! ```
//!
//! All parameters live in one [`nn::VarStore`] so the whole network can be
//! frozen, handed to an optimiser, saved, or restored from a checkpoint in a
//! single call.
//!
//! # Checkpoints
//!
//! [`DenoiserFactory`] builds a fresh model for every sample and restores the
//! pretrained weights from disk. Loading is non-strict: variables missing from
//! the checkpoint keep their random initialisation. A missing or unreadable
//! checkpoint is reported with `warn!` and never aborts the run.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tch::{nn, nn::Module, Device, Tensor};
use tracing::{debug, info, warn};

use crate::config::AdaptConfig;
use crate::error::{TtaError, TtaResult};

// ---------------------------------------------------------------------------
// ModelConfig
// ---------------------------------------------------------------------------

/// Shape hyper-parameters of the [`Denoiser`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Image channels (3 for RGB). Default: **3**.
    pub channels: usize,
    /// Hidden feature maps per convolution. Default: **32**.
    pub features: usize,
    /// Number of 3×3 convolutions, including input and output layers.
    /// Default: **5**.
    pub depth: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig { channels: 3, features: 32, depth: 5 }
    }
}

// ---------------------------------------------------------------------------
// Denoiser
// ---------------------------------------------------------------------------

/// Residual denoiser: predicts the noise and subtracts it from the input.
///
/// Implements [`nn::Module`], which is the handle self-supervised losses
/// receive. Gradient tracking of every parameter is toggled together with
/// [`Denoiser::set_trainable`].
#[derive(Debug)]
pub struct Denoiser {
    vs: nn::VarStore,
    body: nn::Sequential,
    config: ModelConfig,
}

impl Denoiser {
    /// Create a randomly initialised model on `device`.
    pub fn new(config: &ModelConfig, device: Device) -> Self {
        let vs = nn::VarStore::new(device);
        let body = residual_body(&(vs.root() / "body"), config);
        Denoiser { vs, body, config: config.clone() }
    }

    /// Enable or disable gradient tracking on every parameter.
    pub fn set_trainable(&mut self, trainable: bool) {
        if trainable {
            self.vs.unfreeze();
        } else {
            self.vs.freeze();
        }
    }

    /// Total number of scalar parameters.
    pub fn num_parameters(&self) -> usize {
        self.vs
            .trainable_variables()
            .iter()
            .map(|t| t.numel() as usize)
            .sum()
    }

    /// Number of scalar parameters that currently track gradients.
    pub fn num_trainable_parameters(&self) -> usize {
        self.vs
            .trainable_variables()
            .iter()
            .filter(|t| t.requires_grad())
            .map(|t| t.numel() as usize)
            .sum()
    }

    /// Architecture this model was built with.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Access the internal `VarStore` (e.g. to create an optimiser).
    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    /// Mutable access to the internal `VarStore`.
    pub fn var_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.vs
    }

    /// Save model weights to `path`. The format follows the extension
    /// (`.safetensors`, `.ot`, …) as understood by tch.
    ///
    /// # Errors
    ///
    /// Returns [`TtaError::Checkpoint`] if the file cannot be written.
    pub fn save(&self, path: &Path) -> TtaResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        self.vs
            .save(path)
            .map_err(|e| TtaError::checkpoint(e.to_string(), path))
    }
}

impl nn::Module for Denoiser {
    fn forward(&self, xs: &Tensor) -> Tensor {
        xs - self.body.forward(xs)
    }
}

/// Build the convolutional stack predicting the noise residual.
fn residual_body(path: &nn::Path, config: &ModelConfig) -> nn::Sequential {
    let c = config.channels as i64;
    let f = config.features as i64;
    let conv_cfg = nn::ConvConfig { padding: 1, ..Default::default() };

    let mut body = nn::seq()
        .add(nn::conv2d(path / "conv_in", c, f, 3, conv_cfg))
        .add_fn(|xs| xs.relu());
    for i in 0..config.depth.saturating_sub(2) {
        body = body
            .add(nn::conv2d(path / format!("conv{i}"), f, f, 3, conv_cfg))
            .add_fn(|xs| xs.relu());
    }
    body.add(nn::conv2d(path / "conv_out", f, c, 3, conv_cfg))
}

// ---------------------------------------------------------------------------
// Checkpoint loading
// ---------------------------------------------------------------------------

/// Outcome of restoring pretrained weights into a [`Denoiser`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointStatus {
    /// Every variable was restored.
    Loaded,
    /// The checkpoint was read but lacked some variables; those keep their
    /// random initialisation.
    Partial {
        /// Names of the variables absent from the checkpoint.
        missing: Vec<String>,
    },
    /// No file at the checkpoint path.
    Missing,
    /// The file exists but could not be parsed.
    Invalid {
        /// Backend error message.
        reason: String,
    },
}

impl CheckpointStatus {
    /// `true` when at least part of the weights came from disk.
    pub fn is_loaded(&self) -> bool {
        matches!(self, CheckpointStatus::Loaded | CheckpointStatus::Partial { .. })
    }
}

/// Restore weights from `path` into `model` without failing.
///
/// Errors are folded into the returned [`CheckpointStatus`]; `model` keeps
/// whatever weights it had for any variable that could not be restored.
pub fn load_checkpoint(model: &mut Denoiser, path: &Path) -> CheckpointStatus {
    if !path.is_file() {
        return CheckpointStatus::Missing;
    }
    match model.var_store_mut().load_partial(path) {
        Ok(missing) if missing.is_empty() => CheckpointStatus::Loaded,
        Ok(missing) => CheckpointStatus::Partial { missing },
        Err(e) => CheckpointStatus::Invalid { reason: e.to_string() },
    }
}

// ---------------------------------------------------------------------------
// DenoiserFactory
// ---------------------------------------------------------------------------

/// Builds a fresh, pretrained [`Denoiser`] on every call.
///
/// There is no cached model: each sample gets its own instance so that no
/// learned state survives between independent adaptation trials.
#[derive(Debug)]
pub struct DenoiserFactory {
    config: ModelConfig,
    checkpoint: PathBuf,
    device: Device,
    reported: AtomicBool,
}

impl DenoiserFactory {
    /// Create a factory for `config` that restores weights from `checkpoint`.
    pub fn new(config: ModelConfig, checkpoint: impl Into<PathBuf>, device: Device) -> Self {
        DenoiserFactory {
            config,
            checkpoint: checkpoint.into(),
            device,
            reported: AtomicBool::new(false),
        }
    }

    /// Factory described by an [`AdaptConfig`].
    pub fn from_config(cfg: &AdaptConfig) -> Self {
        Self::new(cfg.model.clone(), cfg.checkpoint_path.clone(), cfg.device())
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Path weights are restored from.
    pub fn checkpoint(&self) -> &Path {
        &self.checkpoint
    }

    /// Device every model is built on.
    pub fn device(&self) -> Device {
        self.device
    }

    /// Build a new model and restore the checkpoint into it.
    ///
    /// The returned model is trainable; callers freeze it when only the
    /// adapter is optimised.
    pub fn build(&self) -> Denoiser {
        let mut model = Denoiser::new(&self.config, self.device);
        let status = load_checkpoint(&mut model, &self.checkpoint);
        self.report(&status);
        model
    }

    /// Log the checkpoint status at `warn`/`info` the first time, `debug`
    /// afterwards (a model is built for every sample).
    fn report(&self, status: &CheckpointStatus) {
        let first = !self.reported.swap(true, Ordering::Relaxed);
        let path = self.checkpoint.display();
        match status {
            CheckpointStatus::Loaded if first => info!("Loaded denoiser weights from {path}"),
            CheckpointStatus::Partial { missing } if first => warn!(
                "Checkpoint {path} lacks {} variable(s), keeping random init for them: {missing:?}",
                missing.len()
            ),
            CheckpointStatus::Missing if first => warn!(
                "Checkpoint {path} not found; continuing with randomly initialised weights"
            ),
            CheckpointStatus::Invalid { reason } if first => warn!(
                "Checkpoint {path} could not be loaded ({reason}); continuing with randomly initialised weights"
            ),
            other => debug!("Checkpoint {path}: {other:?}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
