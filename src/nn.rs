//! Components to build a neural network

use std::{
    collections::HashMap,
    sync::atomic::{self, AtomicUsize},
};

use rand::Rng;
use thiserror::Error;

use crate::{
    tensor::{Tensor, TensorError},
    values::Value,
};

/// Errors for the neural network
#[derive(Debug, Error, PartialEq)]
pub enum NNError {
    #[error("Input size mismatch: expected {expected}, got {got}")]
    InputSizeMismatch { expected: usize, got: usize },
    #[error("{module} has no {kind} named '{name}' to rebuild from")]
    MissingPart {
        module: &'static str,
        kind: &'static str,
        name: String,
    },
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

/// The named pieces a module is reassembled from, see [`Module::rebuild`]
#[derive(Default)]
pub struct ModuleParts {
    parameters: HashMap<String, Tensor>,
    buffers: HashMap<String, Tensor>,
    children: HashMap<String, Box<dyn Module>>,
}

impl ModuleParts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_parameter(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.parameters.insert(name.into(), tensor);
    }

    pub fn insert_buffer(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.buffers.insert(name.into(), tensor);
    }

    pub fn insert_child(&mut self, name: impl Into<String>, child: Box<dyn Module>) {
        self.children.insert(name.into(), child);
    }

    pub fn take_parameter(&mut self, module: &'static str, name: &str) -> Result<Tensor, NNError> {
        self.parameters
            .remove(name)
            .ok_or_else(|| missing(module, "parameter", name))
    }

    pub fn take_buffer(&mut self, module: &'static str, name: &str) -> Result<Tensor, NNError> {
        self.buffers
            .remove(name)
            .ok_or_else(|| missing(module, "buffer", name))
    }

    pub fn take_child(
        &mut self,
        module: &'static str,
        name: &str,
    ) -> Result<Box<dyn Module>, NNError> {
        self.children
            .remove(name)
            .ok_or_else(|| missing(module, "child", name))
    }
}

fn missing(module: &'static str, kind: &'static str, name: &str) -> NNError {
    NNError::MissingPart {
        module,
        kind,
        name: name.to_string(),
    }
}

/// Represents the torch.nn.Module. NNs should implement this trait.
/// <https://github.com/pytorch/pytorch/blob/v2.6.0/torch/nn/modules/module.py#L402>
///
/// Besides `forward`, a module describes its own tree: the tensors it owns directly, its named
/// children, and how to put an instance of the same type back together from new versions of
/// those parts. This is what lets [`crate::cloner`] copy or update any module generically.
pub trait Module {
    /// Type name, used in errors and logs
    fn name(&self) -> &'static str;

    fn forward(&self, input: &Tensor) -> Result<Tensor, NNError>;

    /// Trainable tensors owned by this module itself (not by its children)
    fn direct_parameters(&self) -> Vec<(String, Tensor)> {
        Vec::new()
    }

    /// Persistent tensors which are not trained, e.g. running statistics
    fn direct_buffers(&self) -> Vec<(String, Tensor)> {
        Vec::new()
    }

    fn children(&self) -> Vec<(String, &dyn Module)> {
        Vec::new()
    }

    /// Builds a module of the same concrete type and configuration from `parts`, which holds
    /// one entry for each name returned by `direct_parameters`, `direct_buffers` and `children`
    fn rebuild(&self, parts: ModuleParts) -> Result<Box<dyn Module>, NNError>;

    /// All parameters keyed by their path from this module, e.g. `0.weight`
    fn named_parameters(&self) -> Vec<(String, Tensor)> {
        let mut named = self.direct_parameters();
        for (child_name, child) in self.children() {
            named.extend(
                child
                    .named_parameters()
                    .into_iter()
                    .map(|(name, t)| (format!("{child_name}.{name}"), t)),
            );
        }
        named
    }

    fn parameters(&self) -> Vec<Tensor> {
        self.named_parameters().into_iter().map(|(_, t)| t).collect()
    }

    fn named_buffers(&self) -> Vec<(String, Tensor)> {
        let mut named = self.direct_buffers();
        for (child_name, child) in self.children() {
            named.extend(
                child
                    .named_buffers()
                    .into_iter()
                    .map(|(name, t)| (format!("{child_name}.{name}"), t)),
            );
        }
        named
    }

    fn zero_grad(&mut self) {
        for p in self.parameters().iter_mut() {
            p.zero_grad();
        }
    }
}

/// Fully connected layer, `y = x W^T + b` for a batch `x` of shape `[batch, n_inputs]`
pub struct Linear {
    /// `[n_outputs, n_inputs]`
    weight: Tensor,
    /// `[n_outputs]`
    bias: Tensor,
    n_inputs: usize,
    n_outputs: usize,
    n_output_nans: AtomicUsize,
}

impl Linear {
    /// Creates a new layer with the given number of inputs and outputs
    pub fn new(n_inputs: usize, n_outputs: usize) -> Self {
        Self::with_rng(n_inputs, n_outputs, &mut rand::rng())
    }

    pub fn with_rng<R: Rng + ?Sized>(n_inputs: usize, n_outputs: usize, rng: &mut R) -> Self {
        // He initialization to ensure the variance of the output is the same as the input
        // and keep weights relatively small to avoid exploding or vanishing gradients (or even just
        // activation values for that matter, e.g. softmax)
        let std = (2.0 / n_inputs.max(1) as f32).sqrt();
        let weight = Tensor::randn(&[n_outputs, n_inputs], std, true, rng);
        let bias = Tensor::randn(&[n_outputs], std, true, rng);
        match (weight, bias) {
            (Ok(weight), Ok(bias)) => Self::from_tensors(weight, bias, n_inputs, n_outputs),
            // std is always finite and positive
            _ => unreachable!("invalid He initialization std {std}"),
        }
    }

    /// Layer with every weight and bias set to one
    pub fn ones(n_inputs: usize, n_outputs: usize) -> Self {
        Self::from_tensors(
            Tensor::full(&[n_outputs, n_inputs], 1.0, true),
            Tensor::full(&[n_outputs], 1.0, true),
            n_inputs,
            n_outputs,
        )
    }

    fn from_tensors(weight: Tensor, bias: Tensor, n_inputs: usize, n_outputs: usize) -> Self {
        Self {
            weight,
            bias,
            n_inputs,
            n_outputs,
            n_output_nans: AtomicUsize::new(0),
        }
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> &Tensor {
        &self.bias
    }

    /// Number of NaN outputs in the last forward pass (used for debugging)
    pub fn n_output_nans(&self) -> usize {
        self.n_output_nans.load(atomic::Ordering::Relaxed)
    }
}

impl Module for Linear {
    fn name(&self) -> &'static str {
        "Linear"
    }

    /// Computes forward pass for a layer
    fn forward(&self, input: &Tensor) -> Result<Tensor, NNError> {
        let (batch, n_inputs) = input.dims2()?;
        if n_inputs != self.n_inputs {
            return Err(NNError::InputSizeMismatch {
                expected: self.n_inputs,
                got: n_inputs,
            });
        }
        let weight_rows = self.weight.rows()?.collect::<Vec<_>>();
        let mut outputs = Vec::with_capacity(batch * self.n_outputs);
        for row in input.rows()? {
            for (w, b) in weight_rows.iter().zip(self.bias.values()) {
                let output = w.iter().zip(row).map(|(w, x)| w * x).sum::<Value>();
                outputs.push(&output + b);
            }
        }
        let n_output_nans = outputs.iter().filter(|v| v.data().is_nan()).count();
        self.n_output_nans
            .store(n_output_nans, atomic::Ordering::Relaxed);
        if n_output_nans > 0 {
            log::debug!("n_output_nans: {}", n_output_nans);
        }
        Ok(Tensor::new(outputs, &[batch, self.n_outputs])?)
    }

    fn direct_parameters(&self) -> Vec<(String, Tensor)> {
        vec![
            ("weight".to_string(), self.weight.clone()),
            ("bias".to_string(), self.bias.clone()),
        ]
    }

    fn rebuild(&self, mut parts: ModuleParts) -> Result<Box<dyn Module>, NNError> {
        let weight = parts.take_parameter(self.name(), "weight")?;
        let bias = parts.take_parameter(self.name(), "bias")?;
        Ok(Box::new(Self::from_tensors(
            weight,
            bias,
            self.n_inputs,
            self.n_outputs,
        )))
    }
}

/// Applies ReLU to a set of values, works for arbitrary number of inputs
#[derive(Default)]
pub struct ReLU {
    n_dead_neurons: AtomicUsize,
}

impl ReLU {
    pub fn new() -> Self {
        Self {
            n_dead_neurons: AtomicUsize::new(0),
        }
    }

    /// Returns the number of dead neurons in the last forward pass (used for debugging)
    pub fn n_dead_neurons(&self) -> usize {
        self.n_dead_neurons.load(atomic::Ordering::Relaxed)
    }
}

impl Module for ReLU {
    fn name(&self) -> &'static str {
        "ReLU"
    }

    /// Takes the element-wise ReLU of the input values
    fn forward(&self, input: &Tensor) -> Result<Tensor, NNError> {
        let n_dead_neurons = input.values().iter().filter(|v| v.data() <= 0.0).count();
        self.n_dead_neurons
            .store(n_dead_neurons, atomic::Ordering::Relaxed);
        Ok(input.relu())
    }

    fn rebuild(&self, _parts: ModuleParts) -> Result<Box<dyn Module>, NNError> {
        Ok(Box::new(ReLU::new()))
    }
}

#[derive(Default)]
pub struct Sigmoid;

impl Module for Sigmoid {
    fn name(&self) -> &'static str {
        "Sigmoid"
    }

    fn forward(&self, input: &Tensor) -> Result<Tensor, NNError> {
        Ok(input.sigmoid())
    }

    fn rebuild(&self, _parts: ModuleParts) -> Result<Box<dyn Module>, NNError> {
        Ok(Box::new(Sigmoid))
    }
}

#[derive(Default)]
pub struct Tanh;

impl Module for Tanh {
    fn name(&self) -> &'static str {
        "Tanh"
    }

    fn forward(&self, input: &Tensor) -> Result<Tensor, NNError> {
        Ok(input.tanh())
    }

    fn rebuild(&self, _parts: ModuleParts) -> Result<Box<dyn Module>, NNError> {
        Ok(Box::new(Tanh))
    }
}

/// Applies softmax to each row of a `[batch, features]` tensor
#[derive(Default)]
pub struct Softmax;

impl Module for Softmax {
    fn name(&self) -> &'static str {
        "Softmax"
    }

    fn forward(&self, input: &Tensor) -> Result<Tensor, NNError> {
        let mut outputs = Vec::with_capacity(input.len());
        for row in input.rows()? {
            // shifting by the row max keeps exp from overflowing, the constant cancels out
            let max = row
                .iter()
                .map(|v| v.data())
                .fold(f32::NEG_INFINITY, f32::max);
            let shift = Value::new(max);
            let exps = row.iter().map(|v| (v - &shift).exp()).collect::<Vec<_>>();
            let exp_sum = exps.iter().cloned().sum::<Value>();
            outputs.extend(exps.iter().map(|e| e / &exp_sum));
        }
        Ok(Tensor::new(outputs, input.shape())?)
    }

    fn rebuild(&self, _parts: ModuleParts) -> Result<Box<dyn Module>, NNError> {
        Ok(Box::new(Softmax))
    }
}

/// Chains modules, children are named by their position (`0`, `1`, ...)
#[derive(Default)]
pub struct Sequential {
    layers: Vec<Box<dyn Module>>,
    buffers: Vec<(String, Tensor)>,
}

impl Sequential {
    pub fn new(layers: Vec<Box<dyn Module>>) -> Self {
        Self {
            layers,
            buffers: Vec::new(),
        }
    }

    pub fn push(&mut self, layer: Box<dyn Module>) {
        self.layers.push(layer);
    }

    /// Registers a persistent tensor which is carried along with the module but never trained
    pub fn register_buffer(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.buffers.push((name.into(), tensor.detach()));
    }

    pub fn layer(&self, index: usize) -> Option<&dyn Module> {
        self.layers.get(index).map(|l| l.as_ref())
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl Module for Sequential {
    fn name(&self) -> &'static str {
        "Sequential"
    }

    fn forward(&self, input: &Tensor) -> Result<Tensor, NNError> {
        let mut output = input.clone();
        for layer in self.layers.iter() {
            output = layer.forward(&output)?;
        }
        Ok(output)
    }

    fn direct_buffers(&self) -> Vec<(String, Tensor)> {
        self.buffers.clone()
    }

    fn children(&self) -> Vec<(String, &dyn Module)> {
        self.layers
            .iter()
            .enumerate()
            .map(|(i, l)| (i.to_string(), l.as_ref()))
            .collect()
    }

    fn rebuild(&self, mut parts: ModuleParts) -> Result<Box<dyn Module>, NNError> {
        let layers = (0..self.layers.len())
            .map(|i| parts.take_child(self.name(), &i.to_string()))
            .collect::<Result<Vec<_>, _>>()?;
        let buffers = self
            .buffers
            .iter()
            .map(|(name, _)| Ok((name.clone(), parts.take_buffer(self.name(), name)?)))
            .collect::<Result<Vec<_>, NNError>>()?;
        Ok(Box::new(Self { layers, buffers }))
    }
}
