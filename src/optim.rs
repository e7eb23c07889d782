//! Optimizer(s) for the outer loop
//!
//! Inner-loop steps happen inside the graph (see [`crate::maml`]); these optimizers update the
//! data of leaf tensors in place, outside of the graph, from their accumulated gradients.

use crate::tensor::Tensor;

/// Common interface for optimizers
/// Analogous to the torch.optim.Optimizer interface
/// <https://pytorch.org/docs/stable/optim.html#base-class>
pub trait Optim {
    /// Performs a single optimization step with accumulated gradients
    fn step(&mut self);
    /// Zeros gradients for all parameters
    fn zero_grad(&mut self);
}

/// SGD with momentum
pub struct SGD {
    params: Vec<Tensor>,
    // currently does not change the learning rate based on the iteration
    // ideally lr would decay over time
    lr: f32,
    momentum: f32,
    // velocity per parameter element
    velocity: Vec<Vec<f32>>,
}

impl SGD {
    pub fn new(params: Vec<Tensor>, lr: f32, momentum: f32) -> Self {
        let velocity = params.iter().map(|p| vec![0.0; p.len()]).collect();
        Self {
            params,
            lr,
            momentum,
            velocity,
        }
    }

    #[cfg(test)]
    fn velocities(&self) -> &[Vec<f32>] {
        &self.velocity
    }
}

impl Optim for SGD {
    fn step(&mut self) {
        for (param, velocity) in self.params.iter_mut().zip(self.velocity.iter_mut()) {
            // parameters which took no part in the loss keep their value
            let Some(grad) = param.grad() else {
                continue;
            };
            let mut values = param.data();
            for ((value, v), g) in values.iter_mut().zip(velocity.iter_mut()).zip(grad) {
                // SGD with momentum
                *v = self.momentum * *v - self.lr * g;
                *value += *v;
            }
            if let Err(e) = param.set_data(&values) {
                log::error!("skipping parameter update: {}", e);
            }
        }
    }

    fn zero_grad(&mut self) {
        for param in self.params.iter_mut() {
            param.zero_grad();
        }
    }
}
