//! Integration tests for [`lan_tta::losses`].
//!
//! Stochastic strategies are exercised under fixed `tch::manual_seed`
//! values so every run sees the same sub-sampling masks.

use lan_tta::losses::{pair_downsample, LossKind, Nbr2nbr, SelfSupervisedLoss, Zsn2n};
use lan_tta::model::{Denoiser, ModelConfig};
use tch::{nn::Module, Device, Kind, Tensor};

fn tiny_model() -> Denoiser {
    tch::manual_seed(0);
    Denoiser::new(&ModelConfig { channels: 3, features: 8, depth: 3 }, Device::Cpu)
}

fn noisy_input() -> Tensor {
    tch::manual_seed(1);
    Tensor::rand([1, 3, 16, 16], (Kind::Float, Device::Cpu))
}

fn strategies() -> Vec<Box<dyn SelfSupervisedLoss>> {
    vec![LossKind::Zsn2n.build(2.0), LossKind::Nbr2nbr.build(2.0)]
}

#[test]
fn losses_are_finite_non_negative_scalars() {
    let model = tiny_model();
    let x = noisy_input();
    for strategy in strategies() {
        let loss = strategy.loss(&x, &model, 0, 20);
        assert_eq!(loss.size(), Vec::<i64>::new(), "{} must be a scalar", strategy.name());
        let v = loss.double_value(&[]);
        assert!(v.is_finite() && v >= 0.0, "{} = {v}", strategy.name());
    }
}

#[test]
fn gradients_reach_model_parameters() {
    for strategy in strategies() {
        let model = tiny_model();
        let x = noisy_input();
        strategy.loss(&x, &model, 10, 20).backward();
        let with_grad = model
            .var_store()
            .trainable_variables()
            .iter()
            .filter(|v| v.grad().defined() && v.grad().abs().sum(Kind::Float).double_value(&[]) > 0.0)
            .count();
        assert!(with_grad > 0, "{} produced no gradient", strategy.name());
    }
}

#[test]
fn gradients_reach_a_learnable_input() {
    let mut model = tiny_model();
    model.set_trainable(false);
    for strategy in strategies() {
        let x = noisy_input().set_requires_grad(true);
        strategy.loss(&x, &model, 5, 20).backward();
        assert!(x.grad().defined(), "{} did not reach the input", strategy.name());
    }
}

#[test]
fn odd_sized_inputs_are_accepted() {
    let model = tiny_model();
    let x = Tensor::rand([1, 3, 15, 13], (Kind::Float, Device::Cpu));
    for strategy in strategies() {
        let v = strategy.loss(&x, &model, 1, 20).double_value(&[]);
        assert!(v.is_finite(), "{} failed on odd input", strategy.name());
    }
}

#[test]
fn zsn2n_is_deterministic() {
    let model = tiny_model();
    let x = noisy_input();
    let a = Zsn2n.loss(&x, &model, 0, 20).double_value(&[]);
    let b = Zsn2n.loss(&x, &model, 19, 20).double_value(&[]);
    assert_eq!(a, b, "zsn2n must not depend on the step or the RNG");
}

#[test]
fn nbr2nbr_regulariser_grows_with_step() {
    let model = tiny_model();
    let x = noisy_input();
    let strategy = Nbr2nbr::new(2.0);
    tch::manual_seed(7);
    let early = strategy.loss(&x, &model, 0, 20).double_value(&[]);
    tch::manual_seed(7);
    let late = strategy.loss(&x, &model, 20, 20).double_value(&[]);
    assert!(late >= early, "late={late} early={early}");
}

#[test]
fn pair_downsample_halves_resolution_and_preserves_mean_of_constant() {
    let x = Tensor::full([1, 3, 8, 12], 0.4, (Kind::Float, Device::Cpu));
    let (d1, d2) = pair_downsample(&x);
    assert_eq!(d1.size(), vec![1, 3, 4, 6]);
    assert_eq!(d2.size(), vec![1, 3, 4, 6]);
    let m = d1.mean(Kind::Float).double_value(&[]);
    assert!((m - 0.4).abs() < 1e-6);
}

#[test]
fn model_is_usable_as_module_object() {
    let model = tiny_model();
    let module: &dyn Module = &model;
    let y = module.forward(&noisy_input());
    assert_eq!(y.size(), vec![1, 3, 16, 16]);
}
