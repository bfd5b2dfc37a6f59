//! Per-sample adaptation loop.
//!
//! Every sample goes through the same lifecycle:
//!
//! ```text
//! seed(seed + idx)
//!   └─► SampleSession::new      fresh model (checkpoint reloaded), fresh adapter,
//!         │                     Adam bound to the adapted parameter set
//!         ├─► run: inner_loop × { zero_grad → adapt → no-grad prediction
//!         │                       → self-supervised loss → backward → step
//!         │                       → (psnr, ssim) of the prediction }
//!         ├─► final no-grad evaluation (record `inner_loop`)
//!         └─► drop                nothing survives into the next sample
//! ```
//!
//! The prediction recorded at step `k` is taken *before* that step's update,
//! so record 0 measures the unadapted model and record `inner_loop` the fully
//! adapted one.

use tch::{nn, nn::Module, nn::OptimizerConfig, Tensor};
use tracing::{debug, warn};

use crate::adapter::{AdaptationTarget, Adapter};
use crate::config::AdaptConfig;
use crate::dataset::ImagePair;
use crate::error::{TtaError, TtaResult};
use crate::losses::SelfSupervisedLoss;
use crate::metrics::{self, SampleLog, StepMetrics};
use crate::model::{Denoiser, DenoiserFactory};

// ---------------------------------------------------------------------------
// SampleSession
// ---------------------------------------------------------------------------

/// Adapter, model and optimizer owned by a single sample.
pub struct SampleSession {
    target: AdaptationTarget,
    adapter: Adapter,
    model: Denoiser,
    optimizer: nn::Optimizer,
}

impl SampleSession {
    /// Build a session for inputs of `input_shape` (`[1, C, H, W]`).
    ///
    /// The model comes from `factory` with its parameters trainable only
    /// under [`AdaptationTarget::Model`]; Adam is bound to the adapter's
    /// store under [`AdaptationTarget::Adapter`] and to the model's otherwise.
    ///
    /// # Errors
    ///
    /// [`TtaError::ShapeMismatch`] when `input_shape` is not a single
    /// `[1, C, H, W]` image with the model's channel count.
    pub fn new(
        target: AdaptationTarget,
        factory: &DenoiserFactory,
        input_shape: &[i64],
        learning_rate: f64,
    ) -> TtaResult<Self> {
        let channels = factory.config().channels as i64;
        match input_shape {
            [1, c, _, _] if *c == channels => {}
            _ => {
                let mut expected = input_shape.to_vec();
                expected.resize(4, -1);
                expected[0] = 1;
                expected[1] = channels;
                return Err(TtaError::shape_mismatch(expected, input_shape.to_vec()));
            }
        }

        let mut model = factory.build();
        model.set_trainable(target.model_trainable());
        let adapter = Adapter::for_target(target, input_shape, factory.device());

        let optimizer = {
            let vs = adapter.var_store().unwrap_or_else(|| model.var_store());
            nn::Adam::default().build(vs, learning_rate)?
        };

        Ok(SampleSession { target, adapter, model, optimizer })
    }

    pub fn target(&self) -> AdaptationTarget {
        self.target
    }

    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    pub fn model(&self) -> &Denoiser {
        &self.model
    }

    /// Clipped no-grad prediction for `lq` with the current parameters.
    pub fn predict(&self, lq: &Tensor) -> Tensor {
        tch::no_grad(|| self.model.forward(&self.adapter.forward(lq)).clamp(0.0, 1.0))
    }

    /// Run `inner_loop` optimisation steps plus the final evaluation.
    ///
    /// Returns exactly `inner_loop + 1` records, steps `0..=inner_loop`.
    /// A non-finite loss (or one that carries no gradient) skips that
    /// step's update with a warning; its metrics are still recorded.
    pub fn run(
        &mut self,
        idx: usize,
        lq: &Tensor,
        gt: &Tensor,
        loss_fn: &dyn SelfSupervisedLoss,
        inner_loop: usize,
    ) -> TtaResult<SampleLog> {
        let mut log = SampleLog::new(idx);

        for step in 0..inner_loop {
            self.optimizer.zero_grad();

            let adapted = self.adapter.forward(lq);
            let pred = tch::no_grad(|| self.model.forward(&adapted).clamp(0.0, 1.0));

            let loss = loss_fn.loss(&adapted, &self.model, step, inner_loop);
            let loss_value = loss.f_double_value(&[])?;

            if !loss_value.is_finite() {
                warn!("Sample {idx} step {step}: non-finite {} loss, update skipped", loss_fn.name());
            } else if !loss.requires_grad() {
                warn!("Sample {idx} step {step}: loss carries no gradient, update skipped");
            } else {
                loss.f_backward()?;
                self.optimizer.step();
            }

            let (psnr, ssim) = metrics::compute(&pred, gt)?;
            debug!(
                "sample={idx} step={step} loss={loss_value:.6} psnr={psnr:.4} ssim={ssim:.4}"
            );
            log.push(StepMetrics { step, psnr, ssim, loss: Some(loss_value) });
        }

        let (psnr, ssim) = metrics::compute(&self.predict(lq), gt)?;
        debug!("sample={idx} step={inner_loop} (final) psnr={psnr:.4} ssim={ssim:.4}");
        log.push(StepMetrics { step: inner_loop, psnr, ssim, loss: None });

        Ok(log)
    }
}

// ---------------------------------------------------------------------------
// AdaptationLoop
// ---------------------------------------------------------------------------

/// Run-wide settings shared by every sample: target, loop length, learning
/// rate, seed, model factory and the resolved loss strategy.
pub struct AdaptationLoop {
    target: AdaptationTarget,
    inner_loop: usize,
    learning_rate: f64,
    seed: u64,
    factory: DenoiserFactory,
    loss: Box<dyn SelfSupervisedLoss>,
}

impl AdaptationLoop {
    pub fn new(config: &AdaptConfig, factory: DenoiserFactory, loss: Box<dyn SelfSupervisedLoss>) -> Self {
        AdaptationLoop {
            target: config.method,
            inner_loop: config.inner_loop,
            learning_rate: config.learning_rate(),
            seed: config.seed,
            factory,
            loss,
        }
    }

    /// Validate `config`, then resolve its factory and loss strategy.
    pub fn from_config(config: &AdaptConfig) -> TtaResult<Self> {
        config.validate()?;
        let factory = DenoiserFactory::from_config(config);
        let loss = config.self_loss.build(config.nbr2nbr_gamma);
        Ok(Self::new(config, factory, loss))
    }

    pub fn target(&self) -> AdaptationTarget {
        self.target
    }

    pub fn inner_loop(&self) -> usize {
        self.inner_loop
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn factory(&self) -> &DenoiserFactory {
        &self.factory
    }

    pub fn loss(&self) -> &dyn SelfSupervisedLoss {
        self.loss.as_ref()
    }

    /// Build the session used for one sample.
    pub fn session(&self, input_shape: &[i64]) -> TtaResult<SampleSession> {
        SampleSession::new(self.target, &self.factory, input_shape, self.learning_rate)
    }

    /// Adapt to sample `idx` from scratch and return its metric log.
    ///
    /// The tensor RNG is seeded with `seed + idx` first, so a sample's
    /// trajectory does not depend on which samples ran before it.
    pub fn run_sample(&self, idx: usize, pair: &ImagePair) -> TtaResult<SampleLog> {
        tch::manual_seed(self.seed.wrapping_add(idx as u64) as i64);
        let (lq, gt) = pair.to_tensors(self.factory.device());
        let mut session = self.session(&lq.size())?;
        session.run(idx, &lq, &gt, self.loss.as_ref(), self.inner_loop)
    }
}
