//! Model-Agnostic Meta-Learning
//!
//! [`Maml`] wraps a module and adapts copies of it with gradient descent *inside* the
//! computation graph. Each adaptation step computes new parameter tensors from the current
//! ones (`p' = p - lr * g`), so a loss computed after any number of steps can be
//! backpropagated all the way into the original module's parameters.
//!
//! Reference: Finn, C., Abbeel, P., & Levine, S. (2017).
//! "Model-Agnostic Meta-Learning for Fast Adaptation of Deep Networks." arXiv:1703.03400
//!
//! With [`Maml::meta_sgd`] the per-parameter learning rates are learned too.
//!
//! Reference: Li, Z., Zhou, F., Chen, F., & Li, H. (2017).
//! "Meta-SGD: Learning to Learn Quickly for Few-Shot Learning." arXiv:1707.09835

use std::collections::HashMap;

use thiserror::Error;

use crate::{
    autograd::{AutogradError, GradOptions, grad_tensors},
    cloner::{clone_module, clone_parameters, update_module},
    nn::{Module, NNError},
    tensor::{Tensor, TensorError},
    values::Value,
};

/// Errors for adaptation
#[derive(Debug, Error, PartialEq)]
pub enum MamlError {
    #[error(
        "Parameter '{path}' received no gradient, the loss does not depend on it \
         (maybe try with allow_unused)"
    )]
    MissingGradient { path: String },
    #[error(
        "Parameter '{path}' does not require grad and cannot be differentiated \
         (maybe try with allow_nograd)"
    )]
    GradientComputation { path: String },
    #[error("Expected one learning rate per parameter ({expected}), got {got}")]
    LearningRateCount { expected: usize, got: usize },
    #[error(
        "Learning rate for '{path}' has {got} elements, expected 1 or {expected} to match the parameter"
    )]
    LearningRateShape {
        path: String,
        expected: usize,
        got: usize,
    },
    #[error(transparent)]
    Module(#[from] NNError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error(transparent)]
    Autograd(#[from] AutogradError),
}

/// Construction-time configuration of a [`Maml`] wrapper
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MamlConfig {
    /// Detach the inner-loop gradients, dropping second-order terms of the meta-gradient
    pub first_order: bool,
    /// Skip parameters the adaptation loss does not depend on. Defaults to `allow_nograd`
    pub allow_unused: Option<bool>,
    /// Skip parameters which do not require grad
    pub allow_nograd: bool,
}

impl MamlConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn first_order(mut self, first_order: bool) -> Self {
        self.first_order = first_order;
        self
    }

    pub fn allow_unused(mut self, allow_unused: bool) -> Self {
        self.allow_unused = Some(allow_unused);
        self
    }

    pub fn allow_nograd(mut self, allow_nograd: bool) -> Self {
        self.allow_nograd = allow_nograd;
        self
    }

    fn resolve(self) -> AdaptConfig {
        AdaptConfig {
            first_order: self.first_order,
            allow_unused: self.allow_unused.unwrap_or(self.allow_nograd),
            allow_nograd: self.allow_nograd,
        }
    }
}

/// Flags in effect for a wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptConfig {
    pub first_order: bool,
    pub allow_unused: bool,
    pub allow_nograd: bool,
}

impl AdaptConfig {
    /// Values set in `overrides` win, the rest fall back to `self`
    pub fn merge(self, overrides: AdaptOverrides) -> Self {
        Self {
            first_order: overrides.first_order.unwrap_or(self.first_order),
            allow_unused: overrides.allow_unused.unwrap_or(self.allow_unused),
            allow_nograd: overrides.allow_nograd.unwrap_or(self.allow_nograd),
        }
    }
}

/// Per-call overrides for [`Maml::adapt_with`] and [`Maml::clone_with`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdaptOverrides {
    pub first_order: Option<bool>,
    pub allow_unused: Option<bool>,
    pub allow_nograd: Option<bool>,
}

impl AdaptOverrides {
    pub fn first_order(mut self, first_order: bool) -> Self {
        self.first_order = Some(first_order);
        self
    }

    pub fn allow_unused(mut self, allow_unused: bool) -> Self {
        self.allow_unused = Some(allow_unused);
        self
    }

    pub fn allow_nograd(mut self, allow_nograd: bool) -> Self {
        self.allow_nograd = Some(allow_nograd);
        self
    }
}

/// Inner-loop step size
#[derive(Debug, Clone)]
pub enum LearningRate {
    Fixed(f32),
    /// One tensor per parameter, in [`Module::named_parameters`] order. Each holds either a
    /// single rate for the whole parameter or one rate per element.
    PerParameter(Vec<Tensor>),
}

/// Wraps a module for fast adaptation, analogous to `learn2learn.algorithms.MAML`
pub struct Maml {
    module: Box<dyn Module>,
    lr: LearningRate,
    config: AdaptConfig,
}

impl Maml {
    /// Wraps `module` with a fixed inner learning rate and the default configuration
    pub fn new(module: Box<dyn Module>, lr: f32) -> Self {
        Self::with_config(module, lr, MamlConfig::default())
    }

    pub fn with_config(module: Box<dyn Module>, lr: f32, config: MamlConfig) -> Self {
        Self {
            module,
            lr: LearningRate::Fixed(lr),
            config: config.resolve(),
        }
    }

    /// Wraps `module` with one learning-rate tensor per parameter
    pub fn with_learning_rates(
        module: Box<dyn Module>,
        lrs: Vec<Tensor>,
        config: MamlConfig,
    ) -> Result<Self, MamlError> {
        let named = module.named_parameters();
        if lrs.len() != named.len() {
            return Err(MamlError::LearningRateCount {
                expected: named.len(),
                got: lrs.len(),
            });
        }
        for ((path, param), lr) in named.iter().zip(lrs.iter()) {
            if lr.len() != 1 && lr.len() != param.len() {
                return Err(MamlError::LearningRateShape {
                    path: path.clone(),
                    expected: param.len(),
                    got: lr.len(),
                });
            }
        }
        Ok(Self {
            module,
            lr: LearningRate::PerParameter(lrs),
            config: config.resolve(),
        })
    }

    /// Meta-SGD: every parameter element gets its own learnable learning rate, initialised
    /// to `lr`. Include [`Maml::meta_parameters`] in the outer optimizer to train them.
    pub fn meta_sgd(
        module: Box<dyn Module>,
        lr: f32,
        config: MamlConfig,
    ) -> Result<Self, MamlError> {
        let lrs = module
            .parameters()
            .iter()
            .map(|p| Tensor::full(p.shape(), lr, true))
            .collect();
        Self::with_learning_rates(module, lrs, config)
    }

    pub fn module(&self) -> &dyn Module {
        self.module.as_ref()
    }

    pub fn config(&self) -> AdaptConfig {
        self.config
    }

    pub fn learning_rate(&self) -> &LearningRate {
        &self.lr
    }

    /// Per-parameter learning rates, if any
    pub fn learning_rates(&self) -> Option<&[Tensor]> {
        match &self.lr {
            LearningRate::Fixed(_) => None,
            LearningRate::PerParameter(lrs) => Some(lrs.as_slice()),
        }
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor, NNError> {
        self.module.forward(input)
    }

    pub fn parameters(&self) -> Vec<Tensor> {
        self.module.parameters()
    }

    pub fn named_parameters(&self) -> Vec<(String, Tensor)> {
        self.module.named_parameters()
    }

    /// Everything an outer-loop optimizer should update: the module parameters, followed by
    /// the learning rates when they are learnable
    pub fn meta_parameters(&self) -> Vec<Tensor> {
        let mut params = self.parameters();
        if let Some(lrs) = self.learning_rates() {
            params.extend(lrs.iter().filter(|lr| lr.requires_grad()).cloned());
        }
        params
    }

    pub fn zero_grad(&mut self) {
        self.module.zero_grad();
        if let LearningRate::PerParameter(lrs) = &mut self.lr {
            for lr in lrs.iter_mut() {
                lr.zero_grad();
            }
        }
    }

    /// A new wrapper around a graph-linked clone of the module, see [`clone_module`]
    pub fn clone(&self) -> Result<Maml, MamlError> {
        self.clone_with(AdaptOverrides::default())
    }

    pub fn clone_with(&self, overrides: AdaptOverrides) -> Result<Maml, MamlError> {
        let module = clone_module(self.module.as_ref())?;
        let lr = match &self.lr {
            LearningRate::Fixed(lr) => LearningRate::Fixed(*lr),
            LearningRate::PerParameter(lrs) => LearningRate::PerParameter(clone_parameters(lrs)),
        };
        Ok(Maml {
            module,
            lr,
            config: self.config.merge(overrides),
        })
    }

    /// Takes one gradient step on `loss` with the wrapper's configuration
    pub fn adapt(&mut self, loss: &Value) -> Result<(), MamlError> {
        self.adapt_with(loss, AdaptOverrides::default())
    }

    /// Takes one gradient step on `loss`, replacing every parameter `p` of the wrapped module
    /// by `p - lr * dloss/dp`.
    ///
    /// Fails before touching the module if a parameter does not require grad (unless
    /// `allow_nograd`) or if the loss does not depend on it (unless `allow_unused`). Skipped
    /// parameters keep their current tensor.
    pub fn adapt_with(&mut self, loss: &Value, overrides: AdaptOverrides) -> Result<(), MamlError> {
        let config = self.config.merge(overrides);
        let named = self.module.named_parameters();

        let mut differentiable = Vec::with_capacity(named.len());
        for (index, (path, param)) in named.iter().enumerate() {
            if param.requires_grad() {
                differentiable.push(index);
            } else if !config.allow_nograd {
                return Err(MamlError::GradientComputation { path: path.clone() });
            }
        }

        let inputs = differentiable
            .iter()
            .map(|&i| named[i].1.clone())
            .collect::<Vec<_>>();
        let grads = grad_tensors(
            loss,
            &inputs,
            GradOptions {
                create_graph: !config.first_order,
                allow_unused: true,
            },
        )?;

        if !config.allow_unused {
            if let Some(position) = grads.iter().position(|g| g.is_none()) {
                let path = named[differentiable[position]].0.clone();
                return Err(MamlError::MissingGradient { path });
            }
        }

        let mut updates = HashMap::with_capacity(grads.len());
        for (&index, grad) in differentiable.iter().zip(grads) {
            let Some(grad) = grad else {
                continue;
            };
            let (path, param) = &named[index];
            let step = match &self.lr {
                LearningRate::Fixed(lr) => grad.scale(&Value::new(*lr)),
                LearningRate::PerParameter(lrs) => scale_by(&grad, &lrs[index])?,
            };
            updates.insert(path.clone(), param.sub(&step)?);
        }

        log::debug!(
            "adapted {} of {} parameters of {} (first_order: {})",
            updates.len(),
            named.len(),
            self.module.name(),
            config.first_order
        );
        self.module = update_module(self.module.as_ref(), &updates)?;
        Ok(())
    }
}

/// `grad * lr`, where `lr` holds one rate or one rate per element
fn scale_by(grad: &Tensor, lr: &Tensor) -> Result<Tensor, TensorError> {
    match lr.values() {
        [rate] => Ok(grad.scale(rate)),
        rates => grad.mul(&grad.with_values(rates.to_vec())),
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    use super::*;
    use crate::{
        assert_eq_float,
        loss::MSELoss,
        nn::{Linear, ReLU, Sequential, Sigmoid, Softmax},
    };

    const NUM_INPUTS: usize = 7;
    const INPUT_SIZE: usize = 10;
    const HIDDEN_SIZE: usize = 20;
    const INNER_LR: f32 = 0.01;
    const EPSILON: f32 = 1e-8;

    fn model(seed: u64) -> Sequential {
        let mut rng = Pcg64Mcg::seed_from_u64(seed);
        let mut model = Sequential::new(vec![
            Box::new(Linear::with_rng(INPUT_SIZE, HIDDEN_SIZE, &mut rng)),
            Box::new(ReLU::new()),
            Box::new(Linear::with_rng(HIDDEN_SIZE, HIDDEN_SIZE, &mut rng)),
            Box::new(Sigmoid),
            Box::new(Linear::with_rng(HIDDEN_SIZE, HIDDEN_SIZE, &mut rng)),
            Box::new(Softmax),
        ]);
        model.register_buffer("dummy_buf", Tensor::zeros(&[1, 2, 3, 4]));
        model
    }

    fn input(seed: u64) -> Tensor {
        let mut rng = Pcg64Mcg::seed_from_u64(seed);
        Tensor::randn(&[NUM_INPUTS, INPUT_SIZE], 1.0, false, &mut rng).unwrap()
    }

    fn close(x: &Tensor, y: &Tensor) -> bool {
        let distance = x.sub(y).unwrap().norm().data();
        distance <= EPSILON
    }

    fn grad_norm(p: &Tensor) -> f32 {
        p.grad().unwrap().iter().map(|g| g * g).sum::<f32>().sqrt()
    }

    /// Sum of the norms of every other parameter
    fn partial_norm(maml: &Maml) -> Value {
        maml.parameters()
            .iter()
            .step_by(2)
            .map(|p| p.norm())
            .sum()
    }

    fn all_norms(maml: &Maml) -> Value {
        maml.parameters()
            .iter()
            .filter(|p| p.requires_grad())
            .map(|p| p.norm())
            .sum()
    }

    #[test]
    fn test_clone_module() {
        for first_order in [false, true] {
            let maml = Maml::with_config(
                Box::new(model(0)),
                INNER_LR,
                MamlConfig::new().first_order(first_order),
            );
            let x = input(1);
            let reference = maml.forward(&x).unwrap();
            for clone in [maml.clone().unwrap(), maml.clone().unwrap()] {
                let out = clone.forward(&x).unwrap();
                assert!(close(&reference, &out));
            }
        }
    }

    #[test]
    fn test_graph_connection() {
        let maml = Maml::new(Box::new(model(0)), INNER_LR);
        let x = input(1);
        let clone = maml.clone().unwrap();
        clone.forward(&x).unwrap().norm().backward();
        for p in maml.parameters() {
            assert!(grad_norm(&p) > 0.0);
        }
    }

    #[test]
    fn test_adaptation() {
        let maml = Maml::new(Box::new(model(0)), INNER_LR);
        let x = input(1);
        let mut clone = maml.clone().unwrap();
        let loss = clone.forward(&x).unwrap().norm();
        clone.adapt(&loss).unwrap();
        let new_loss = clone.forward(&x).unwrap().norm();
        assert!(loss.data() >= new_loss.data());
        new_loss.backward();
        for p in maml.parameters() {
            assert!(grad_norm(&p) > 0.0);
        }
    }

    #[test]
    fn test_adaptation_leaves_buffers_and_structure() {
        let maml = Maml::new(Box::new(model(0)), INNER_LR);
        let x = input(1);
        let mut clone = maml.clone().unwrap();
        let before = clone.named_parameters();
        let buffer = clone.module().named_buffers()[0].1.clone();
        let loss = clone.forward(&x).unwrap().norm();
        clone.adapt(&loss).unwrap();

        let after = clone.named_parameters();
        assert_eq!(before.len(), after.len());
        for ((n1, p1), (n2, p2)) in before.iter().zip(after.iter()) {
            assert_eq!(n1, n2);
            assert_eq!(p1.shape(), p2.shape());
            assert!(p1 != p2);
        }
        let buffers = clone.module().named_buffers();
        assert_eq!(buffers[0].0, "dummy_buf");
        assert_eq!(buffers[0].1.values()[0].id(), buffer.values()[0].id());
        // tensors computed before the step still hold the pre-adaptation values
        for (p, original) in before.iter().zip(maml.parameters()) {
            assert_eq!(p.1, original);
        }
        assert!(loss.requires_grad());
    }

    #[test]
    fn test_multi_step_meta_gradient() {
        let maml = Maml::new(Box::new(model(0)), INNER_LR);
        let x = input(1);
        let mut clone = maml.clone().unwrap();
        for _ in 0..2 {
            let loss = clone.forward(&x).unwrap().norm();
            clone.adapt(&loss).unwrap();
        }
        clone.forward(&x).unwrap().norm().backward();
        assert!(maml.parameters().iter().all(|p| p.grad().is_some()));
    }

    #[test]
    fn test_clones_are_independent() {
        let maml = Maml::new(Box::new(model(0)), 0.5);
        let x = input(1);
        let mut first = maml.clone().unwrap();
        let second = maml.clone().unwrap();
        let reference = second.forward(&x).unwrap();

        let loss = first.forward(&x).unwrap().norm();
        first.adapt(&loss).unwrap();

        assert!(close(&reference, &second.forward(&x).unwrap()));
        assert!(!close(&reference, &first.forward(&x).unwrap()));
        assert!(close(&reference, &maml.forward(&x).unwrap()));
    }

    #[test]
    fn test_allow_unused() {
        let maml = Maml::with_config(
            Box::new(model(0)),
            INNER_LR,
            MamlConfig::new().allow_unused(true),
        );
        let mut clone = maml.clone().unwrap();
        let loss = partial_norm(&clone);
        clone.adapt(&loss).unwrap();
        let loss = partial_norm(&clone);
        loss.backward();
        for (i, p) in maml.parameters().iter().enumerate() {
            // the unused ones were skipped, the used ones have a nonzero gradient
            if i % 2 == 0 {
                assert!(grad_norm(p) > 0.0);
            }
        }

        // once every parameter takes part, every original receives a nonzero gradient,
        // the skipped ones included
        let mut maml = maml;
        maml.zero_grad();
        let mut clone = maml.clone().unwrap();
        let loss = partial_norm(&clone);
        clone.adapt(&loss).unwrap();
        all_norms(&clone).backward();
        for p in maml.parameters() {
            assert!(grad_norm(&p) > 0.0);
        }
    }

    #[test]
    fn test_unused_fails_without_flag() {
        let maml = Maml::new(Box::new(model(0)), INNER_LR);
        let mut clone = maml.clone().unwrap();
        let loss = partial_norm(&clone);
        let err = clone.adapt(&loss).unwrap_err();
        assert_eq!(
            err,
            MamlError::MissingGradient {
                path: "0.bias".to_string()
            }
        );
        // nothing was replaced
        assert!(clone.parameters().iter().zip(maml.parameters()).all(|(c, p)| *c == p));
    }

    #[test]
    fn test_allow_nograd() {
        let base = model(0);
        let frozen = base.named_parameters()[2].1.clone();
        assert!(frozen.set_requires_grad(false).is_ok());
        let maml = Maml::with_config(
            Box::new(base),
            INNER_LR,
            MamlConfig::new().allow_unused(false).allow_nograd(false),
        );
        let mut clone = maml.clone().unwrap();
        let loss = all_norms(&clone);
        let err = clone.adapt(&loss).unwrap_err();
        assert_eq!(
            err,
            MamlError::GradientComputation {
                path: "2.weight".to_string()
            }
        );

        clone
            .adapt_with(&loss, AdaptOverrides::default().allow_nograd(true))
            .unwrap();
        all_norms(&clone).backward();
        assert!(frozen.grad().is_none());
        for p in maml.parameters() {
            if p.requires_grad() {
                assert!(p.grad().is_some());
            }
        }
    }

    #[test]
    fn test_allow_nograd_from_config() {
        let base = model(0);
        let frozen = base.named_parameters()[2].1.clone();
        frozen.set_requires_grad(false).unwrap();
        let maml = Maml::with_config(
            Box::new(base),
            INNER_LR,
            MamlConfig::new().allow_nograd(true),
        );
        // allow_unused follows allow_nograd when not given
        assert!(maml.config().allow_unused);

        let mut clone = maml.clone().unwrap();
        let original = frozen.detach();
        let loss = all_norms(&clone);
        clone.adapt(&loss).unwrap();
        assert!(close(&original, &frozen));
        let adapted_frozen = &clone.named_parameters()[2].1;
        assert!(close(&original, adapted_frozen));
    }

    #[test]
    fn test_first_order_still_reaches_originals() {
        let maml = Maml::with_config(
            Box::new(model(0)),
            INNER_LR,
            MamlConfig::new().first_order(true),
        );
        let x = input(1);
        let mut clone = maml.clone().unwrap();
        let loss = clone.forward(&x).unwrap().norm();
        clone.adapt(&loss).unwrap();
        clone.forward(&x).unwrap().norm().backward();
        assert!(maml.parameters().iter().all(|p| p.grad().is_some()));
    }

    /// Meta-gradient of `(w' x)^2` with respect to `w` after one step on `(w x)^2`, x = 1
    fn scalar_meta_gradient(w: f32, lr: f32, config: MamlConfig, overrides: AdaptOverrides) -> f32 {
        let x = Tensor::from_vec(vec![1.0], &[1, 1]).unwrap();
        let layer = Linear::ones(1, 1);
        layer.weight().clone().set_data(&[w]).unwrap();
        // a frozen zero bias keeps the closed form simple
        let mut bias = layer.bias().clone();
        bias.set_data(&[0.0]).unwrap();
        bias.set_requires_grad(false).unwrap();
        let maml = Maml::with_config(Box::new(layer), lr, config.allow_nograd(true));
        let mut clone = maml.clone().unwrap();
        let out = clone.forward(&x).unwrap();
        let loss = &out.values()[0] * &out.values()[0];
        clone.adapt_with(&loss, overrides).unwrap();
        let out = clone.forward(&x).unwrap();
        (&out.values()[0] * &out.values()[0]).backward();
        maml.parameters()[0].grad().unwrap()[0]
    }

    #[test]
    fn test_first_order_drops_second_order_terms() {
        // one step: w' = w - lr * 2w = w (1 - 2 lr)
        // outer loss w'^2, d/dw = 2 w' (1 - 2 lr) exactly, or 2 w' to first order
        let (w, lr) = (1.5, 0.1);
        let second_order = 2.0 * w * (1.0 - 2.0 * lr) * (1.0 - 2.0 * lr);
        let first_order = 2.0 * w * (1.0 - 2.0 * lr);
        let defaults = AdaptOverrides::default();
        assert_eq_float!(
            scalar_meta_gradient(w, lr, MamlConfig::new(), defaults),
            second_order
        );
        assert_eq_float!(
            scalar_meta_gradient(w, lr, MamlConfig::new().first_order(true), defaults),
            first_order
        );
    }

    #[test]
    fn test_first_order_override_per_call() {
        let (w, lr) = (1.5, 0.1);
        let first_order = 2.0 * w * (1.0 - 2.0 * lr);
        let second_order = first_order * (1.0 - 2.0 * lr);
        assert_eq_float!(
            scalar_meta_gradient(
                w,
                lr,
                MamlConfig::new(),
                AdaptOverrides::default().first_order(true)
            ),
            first_order
        );
        assert_eq_float!(
            scalar_meta_gradient(
                w,
                lr,
                MamlConfig::new().first_order(true),
                AdaptOverrides::default().first_order(false)
            ),
            second_order
        );
    }

    #[test]
    fn test_adapt_on_norm_of_zero_parameter() {
        let layer = Linear::ones(1, 1);
        let mut bias = layer.bias().clone();
        bias.set_data(&[0.0]).unwrap();
        let maml = Maml::new(Box::new(layer), INNER_LR);
        let mut clone = maml.clone().unwrap();
        let loss = all_norms(&clone);
        clone.adapt(&loss).unwrap();

        let adapted = clone.named_parameters();
        assert_eq!(adapted[1].0, "bias");
        assert_eq!(adapted[1].1.data(), vec![0.0]);
        assert_eq_float!(adapted[0].1.data()[0], 1.0 - INNER_LR);

        all_norms(&clone).backward();
        for p in maml.parameters() {
            assert!(p.grad().unwrap().iter().all(|g| g.is_finite()));
        }
        assert_eq!(maml.parameters()[1].grad(), Some(vec![0.0]));
    }

    #[test]
    fn test_per_parameter_learning_rate() {
        let mut rng = Pcg64Mcg::seed_from_u64(9);
        let layer = Linear::with_rng(3, 2, &mut rng);
        let x = Tensor::from_vec(vec![0.5, -1.0, 2.0], &[1, 3]).unwrap();
        let y = Tensor::from_vec(vec![1.0, 0.0], &[1, 2]).unwrap();
        let weight_lr = Tensor::from_vec(vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6], &[2, 3]).unwrap();
        let bias_lr = Tensor::from_vec(vec![0.05], &[1]).unwrap();
        let maml = Maml::with_learning_rates(
            Box::new(layer),
            vec![weight_lr.clone(), bias_lr],
            MamlConfig::new(),
        )
        .unwrap();

        let mut clone = maml.clone().unwrap();
        let before = clone.parameters();
        let loss = MSELoss::call(clone.forward(&x).unwrap().values(), y.values());
        let grads = crate::autograd::grad_tensors(&loss, &before, GradOptions::default()).unwrap();
        clone.adapt(&loss).unwrap();
        let after = clone.parameters();

        let (w0, g0, w1) = (before[0].data(), grads[0].as_ref().unwrap().data(), after[0].data());
        for i in 0..6 {
            assert_eq_float!(w1[i], w0[i] - weight_lr.data()[i] * g0[i]);
        }
        let (b0, g1, b1) = (before[1].data(), grads[1].as_ref().unwrap().data(), after[1].data());
        for i in 0..2 {
            assert_eq_float!(b1[i], b0[i] - 0.05 * g1[i]);
        }
    }

    #[test]
    fn test_learning_rate_validation() {
        let layer = Linear::ones(3, 2);
        let err = Maml::with_learning_rates(
            Box::new(Linear::ones(3, 2)),
            vec![Tensor::zeros(&[1])],
            MamlConfig::new(),
        )
        .err();
        assert_eq!(
            err,
            Some(MamlError::LearningRateCount {
                expected: 2,
                got: 1
            })
        );
        let err = Maml::with_learning_rates(
            Box::new(layer),
            vec![Tensor::zeros(&[4]), Tensor::zeros(&[1])],
            MamlConfig::new(),
        )
        .err();
        assert_eq!(
            err,
            Some(MamlError::LearningRateShape {
                path: "weight".to_string(),
                expected: 6,
                got: 4
            })
        );
    }

    #[test]
    fn test_meta_sgd_learns_learning_rates() {
        let maml = Maml::meta_sgd(Box::new(model(0)), INNER_LR, MamlConfig::new()).unwrap();
        let x = input(1);
        assert_eq!(maml.meta_parameters().len(), 12);

        let mut clone = maml.clone().unwrap();
        assert!(clone.learning_rates().unwrap().iter().all(|lr| !lr.is_leaf()));
        let loss = clone.forward(&x).unwrap().norm();
        clone.adapt(&loss).unwrap();
        clone.forward(&x).unwrap().norm().backward();
        for lr in maml.learning_rates().unwrap() {
            assert!(lr.grad().is_some());
        }
    }

    #[test]
    fn test_config_merge() {
        let config = MamlConfig::new().first_order(true).resolve();
        assert_eq!(
            config,
            AdaptConfig {
                first_order: true,
                allow_unused: false,
                allow_nograd: false
            }
        );
        let merged = config.merge(AdaptOverrides::default().allow_unused(true).first_order(false));
        assert_eq!(
            merged,
            AdaptConfig {
                first_order: false,
                allow_unused: true,
                allow_nograd: false
            }
        );
        let maml = Maml::new(Box::new(Linear::ones(1, 1)), 0.1);
        let clone = maml
            .clone_with(AdaptOverrides::default().allow_nograd(true))
            .unwrap();
        assert!(clone.config().allow_nograd);
        assert!(!maml.config().allow_nograd);
    }
}
