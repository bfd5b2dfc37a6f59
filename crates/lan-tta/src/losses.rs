//! Self-supervised loss strategies for test-time adaptation.
//!
//! Every strategy maps `(adapted input, model, step, total steps)` to a
//! differentiable scalar without looking at ground truth:
//!
//! - **Zero-Shot Noise2Noise** ([`Zsn2n`]): the image is split into two
//!   half-resolution views by fixed diagonal averaging filters. Each view is
//!   denoised and compared with the *other* view (residual term), and the
//!   denoised views are tied to the downsampled full-resolution output
//!   (consistency term).
//! - **Neighbor2Neighbor** ([`Nbr2nbr`]): a random neighbour sub-sampler picks
//!   two adjacent pixels of every 2×2 cell. The model maps the first
//!   sub-image onto the second, regularised by the same sub-sampling applied
//!   to the full-resolution output. The regulariser weight ramps linearly
//!   with the inner-loop step:
//!
//! ```text
//! L = mean((f(g₁x) − g₂x)²) + γ · step/total · mean((f(g₁x) − g₂x − (g₁f(x) − g₂f(x)))²)
//! ```
//!
//! The strategy is chosen once per run through [`LossKind::build`] and used
//! as a `Box<dyn SelfSupervisedLoss>`.
//!
//! Inputs are `[N, C, H, W]`; odd spatial sizes are cropped to the nearest
//! even size before sub-sampling.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tch::{nn::Module, Kind, Reduction, Tensor};

use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// Strategy contract
// ---------------------------------------------------------------------------

/// A ground-truth-free adaptation objective.
///
/// Implementations are stateless between calls; any randomness comes from the
/// global tensor RNG, which the adaptation loop seeds per sample.
pub trait SelfSupervisedLoss: Send + Sync {
    /// Short identifier (`"zsn2n"`, `"nbr2nbr"`).
    fn name(&self) -> &'static str;

    /// Compute the scalar loss for inner-loop iteration `step` of
    /// `total_steps`.
    ///
    /// `model` is called on the gradient-tracking path, so the returned
    /// tensor carries gradients back to whichever parameters are trainable
    /// (the model's own, or the adapter's through `adapted`).
    fn loss(&self, adapted: &Tensor, model: &dyn Module, step: usize, total_steps: usize) -> Tensor;
}

// ---------------------------------------------------------------------------
// LossKind
// ---------------------------------------------------------------------------

/// Closed set of available strategies, as named on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
pub enum LossKind {
    /// Neighbor2Neighbor.
    #[serde(rename = "nbr2nbr")]
    #[value(name = "nbr2nbr")]
    Nbr2nbr,
    /// Zero-Shot Noise2Noise.
    #[serde(rename = "zsn2n")]
    #[value(name = "zsn2n")]
    Zsn2n,
}

impl LossKind {
    /// Name used on the command line and in result file names.
    pub fn name(&self) -> &'static str {
        match self {
            LossKind::Nbr2nbr => "nbr2nbr",
            LossKind::Zsn2n => "zsn2n",
        }
    }

    /// Resolve into the strategy object used for the whole run.
    ///
    /// `nbr2nbr_gamma` is the final regulariser weight of [`Nbr2nbr`] and is
    /// ignored by [`Zsn2n`].
    pub fn build(self, nbr2nbr_gamma: f64) -> Box<dyn SelfSupervisedLoss> {
        match self {
            LossKind::Nbr2nbr => Box::new(Nbr2nbr::new(nbr2nbr_gamma)),
            LossKind::Zsn2n => Box::new(Zsn2n),
        }
    }
}

impl fmt::Display for LossKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LossKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nbr2nbr" => Ok(LossKind::Nbr2nbr),
            "zsn2n" => Ok(LossKind::Zsn2n),
            other => Err(ConfigError::UnknownLoss { name: other.to_string() }),
        }
    }
}

// ---------------------------------------------------------------------------
// Sub-sampling helpers
// ---------------------------------------------------------------------------

/// Crop `[N, C, H, W]` to even height and width.
pub fn crop_even(x: &Tensor) -> Tensor {
    let size = x.size();
    let (h, w) = (size[2], size[3]);
    if h % 2 == 0 && w % 2 == 0 {
        return x.shallow_clone();
    }
    x.narrow(2, 0, h - h % 2).narrow(3, 0, w - w % 2)
}

/// Split an even-sized `[N, C, H, W]` tensor into its 2×2 cells:
/// `[N, C, 4, H/2, W/2]`, with cell positions ordered TL, TR, BL, BR.
fn cells(x: &Tensor) -> Tensor {
    let size = x.size();
    let (n, c, h, w) = (size[0], size[1], size[2], size[3]);
    x.pixel_unshuffle(2).reshape([n, c, 4, h / 2, w / 2])
}

/// Zero-Shot Noise2Noise pair downsampler.
///
/// Returns the two half-resolution views obtained with the 2×2 filters
/// `[[0, ½], [½, 0]]` and `[[½, 0], [0, ½]]` (stride 2, per channel).
pub fn pair_downsample(x: &Tensor) -> (Tensor, Tensor) {
    let cells = cells(&crop_even(x));
    let anti_diagonal = (cells.select(2, 1) + cells.select(2, 2)) * 0.5;
    let diagonal = (cells.select(2, 0) + cells.select(2, 3)) * 0.5;
    (anti_diagonal, diagonal)
}

/// Ordered pairs of horizontally or vertically adjacent positions inside a
/// 2×2 cell (TL=0, TR=1, BL=2, BR=3).
pub const NEIGHBOR_PAIRS: [(i64, i64); 8] =
    [(0, 1), (0, 2), (1, 0), (1, 3), (2, 0), (2, 3), (3, 1), (3, 2)];

/// Random neighbour sub-sampler of Neighbor2Neighbor.
///
/// Draws one [`NEIGHBOR_PAIRS`] entry per 2×2 cell; [`NeighborSubsampler::apply`]
/// can then be applied to several tensors of the same shape (the noisy
/// input and its denoised version) with identical choices.
#[derive(Debug)]
pub struct NeighborSubsampler {
    first: Tensor,
    second: Tensor,
}

impl NeighborSubsampler {
    /// Draw a fresh sub-sampler for even-sized inputs shaped like `x`.
    pub fn random(x: &Tensor) -> Self {
        let size = x.size();
        let (n, h2, w2) = (size[0], size[2] / 2, size[3] / 2);
        let device = x.device();

        let choice = Tensor::randint(
            NEIGHBOR_PAIRS.len() as i64,
            [n, 1, 1, h2, w2],
            (Kind::Int64, device),
        );
        let firsts: Vec<i64> = NEIGHBOR_PAIRS.iter().map(|p| p.0).collect();
        let seconds: Vec<i64> = NEIGHBOR_PAIRS.iter().map(|p| p.1).collect();
        let first = Tensor::from_slice(&firsts).to_device(device).take(&choice);
        let second = Tensor::from_slice(&seconds).to_device(device).take(&choice);
        NeighborSubsampler { first, second }
    }

    /// Extract the two sub-images `(g₁x, g₂x)`, each `[N, C, H/2, W/2]`.
    pub fn apply(&self, x: &Tensor) -> (Tensor, Tensor) {
        let cells = cells(x);
        let size = cells.size();
        let index_shape = [size[0], size[1], 1, size[3], size[4]];
        let pick = |idx: &Tensor| {
            cells
                .gather(2, &idx.expand(index_shape, false), false)
                .squeeze_dim(2)
        };
        (pick(&self.first), pick(&self.second))
    }
}

// ---------------------------------------------------------------------------
// Zsn2n
// ---------------------------------------------------------------------------

/// Zero-Shot Noise2Noise: residual + consistency loss on the pair
/// downsampler views. Deterministic.
#[derive(Debug, Clone, Copy, Default)]
pub struct Zsn2n;

impl SelfSupervisedLoss for Zsn2n {
    fn name(&self) -> &'static str {
        "zsn2n"
    }

    fn loss(&self, adapted: &Tensor, model: &dyn Module, _step: usize, _total: usize) -> Tensor {
        let (noisy1, noisy2) = pair_downsample(adapted);
        let pred1 = model.forward(&noisy1);
        let pred2 = model.forward(&noisy2);

        let loss_res = (noisy1.mse_loss(&pred2, Reduction::Mean)
            + noisy2.mse_loss(&pred1, Reduction::Mean))
            * 0.5;

        let denoised = model.forward(&crop_even(adapted));
        let (down1, down2) = pair_downsample(&denoised);
        let loss_cons = (pred1.mse_loss(&down1, Reduction::Mean)
            + pred2.mse_loss(&down2, Reduction::Mean))
            * 0.5;

        loss_res + loss_cons
    }
}

// ---------------------------------------------------------------------------
// Nbr2nbr
// ---------------------------------------------------------------------------

/// Neighbor2Neighbor with a linearly ramped regulariser. Stochastic: draws a
/// new [`NeighborSubsampler`] on every call.
#[derive(Debug, Clone, Copy)]
pub struct Nbr2nbr {
    gamma: f64,
}

impl Nbr2nbr {
    /// `gamma` is the regulariser weight reached at the final step.
    pub fn new(gamma: f64) -> Self {
        Nbr2nbr { gamma }
    }

    /// Regulariser weight at `step` of `total_steps`.
    pub fn regularizer_weight(&self, step: usize, total_steps: usize) -> f64 {
        self.gamma * step as f64 / total_steps.max(1) as f64
    }
}

impl Default for Nbr2nbr {
    fn default() -> Self {
        Nbr2nbr::new(2.0)
    }
}

impl SelfSupervisedLoss for Nbr2nbr {
    fn name(&self) -> &'static str {
        "nbr2nbr"
    }

    fn loss(&self, adapted: &Tensor, model: &dyn Module, step: usize, total: usize) -> Tensor {
        let x = crop_even(adapted);
        let sampler = NeighborSubsampler::random(&x);
        let (sub1, sub2) = sampler.apply(&x);

        let (sub1_denoised, sub2_denoised) = tch::no_grad(|| sampler.apply(&model.forward(&x)));

        let output = model.forward(&sub1);
        let diff = &output - &sub2;
        let expected_diff = sub1_denoised - sub2_denoised;

        let rec = diff.square().mean(Kind::Float);
        let reg = (&diff - expected_diff).square().mean(Kind::Float);
        rec + reg * self.regularizer_weight(step, total)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
