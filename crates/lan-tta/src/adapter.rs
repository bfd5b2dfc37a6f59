//! Input adapters applied before the denoiser.
//!
//! An experiment adapts exactly one of two disjoint parameter sets, chosen
//! once at startup by [`AdaptationTarget`]:
//!
//! - [`AdaptationTarget::Adapter`] (`lan`): the model is frozen and a
//!   [`Lan`] adapter learns a per-image additive correction
//!   `x + tanh(phi)`.
//! - [`AdaptationTarget::Model`] (`finetune`): the model's own parameters are
//!   optimised and the adapter is the identity.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tch::{nn, Device, Tensor};

use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// AdaptationTarget
// ---------------------------------------------------------------------------

/// Which parameter set the per-sample optimiser is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
pub enum AdaptationTarget {
    /// Fine-tune every parameter of the denoiser.
    #[serde(rename = "finetune")]
    #[value(name = "finetune")]
    Model,
    /// Freeze the denoiser and learn a LAN input correction.
    #[serde(rename = "lan")]
    #[value(name = "lan")]
    Adapter,
}

impl AdaptationTarget {
    /// Name used on the command line and in result file names.
    pub fn name(&self) -> &'static str {
        match self {
            AdaptationTarget::Model => "finetune",
            AdaptationTarget::Adapter => "lan",
        }
    }

    /// Whether the denoiser's parameters track gradients under this target.
    pub fn model_trainable(&self) -> bool {
        matches!(self, AdaptationTarget::Model)
    }
}

impl fmt::Display for AdaptationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AdaptationTarget {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "finetune" => Ok(AdaptationTarget::Model),
            "lan" => Ok(AdaptationTarget::Adapter),
            other => Err(ConfigError::UnknownMethod { name: other.to_string() }),
        }
    }
}

// ---------------------------------------------------------------------------
// Lan
// ---------------------------------------------------------------------------

/// Learnable additive input correction in tanh space.
///
/// Owns a single parameter `phi` with the exact shape of the input, stored in
/// its own [`nn::VarStore`] so an optimiser can be bound to it alone.
/// `phi` starts at zero, so a fresh adapter is the identity until the first
/// optimiser step.
#[derive(Debug)]
pub struct Lan {
    vs: nn::VarStore,
    phi: Tensor,
}

impl Lan {
    /// Create a zero-initialised adapter for inputs of `shape` on `device`.
    pub fn new(shape: &[i64], device: Device) -> Self {
        let vs = nn::VarStore::new(device);
        let phi = vs.root().zeros("phi", shape);
        Lan { vs, phi }
    }

    /// `x + tanh(phi)`.
    pub fn forward(&self, x: &Tensor) -> Tensor {
        x + self.phi.tanh()
    }

    /// The learnable correction tensor.
    pub fn phi(&self) -> &Tensor {
        &self.phi
    }

    /// Store holding `phi`, used to build the optimiser.
    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// Transform applied to the low-quality input before it reaches the model.
#[derive(Debug)]
pub enum Adapter {
    /// Learnable LAN correction.
    Lan(Lan),
    /// No-op: `transform(x) = x`.
    Identity,
}

impl Adapter {
    /// Build the adapter matching `target` for inputs of `shape`.
    ///
    /// Called once per sample; the returned adapter never outlives it.
    pub fn for_target(target: AdaptationTarget, shape: &[i64], device: Device) -> Self {
        match target {
            AdaptationTarget::Adapter => Adapter::Lan(Lan::new(shape, device)),
            AdaptationTarget::Model => Adapter::Identity,
        }
    }

    /// Apply the transform.
    pub fn forward(&self, x: &Tensor) -> Tensor {
        match self {
            Adapter::Lan(lan) => lan.forward(x),
            Adapter::Identity => x.shallow_clone(),
        }
    }

    /// Store of learnable parameters, `None` for the identity.
    pub fn var_store(&self) -> Option<&nn::VarStore> {
        match self {
            Adapter::Lan(lan) => Some(lan.var_store()),
            Adapter::Identity => None,
        }
    }

    /// Number of learnable scalars.
    pub fn num_parameters(&self) -> usize {
        match self {
            Adapter::Lan(lan) => lan.phi().numel() as usize,
            Adapter::Identity => 0,
        }
    }

    /// `true` for the identity variant.
    pub fn is_identity(&self) -> bool {
        matches!(self, Adapter::Identity)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
