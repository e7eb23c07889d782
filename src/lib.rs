//! A minimal library for gradient-based meta-learning (MAML, Meta-SGD)
//! on a scalar autodiff engine with a PyTorch-like API.
//!
//! Modules are cloned into the computation graph ([`cloner`]), adapted with in-graph
//! gradient steps ([`maml`]) and the resulting loss is backpropagated through every step
//! into the original parameters, using higher-order gradients from [`autograd`].

pub mod autograd;
pub mod backprop_fns;
pub mod cloner;
pub mod datasets;
pub mod loss;
pub mod maml;
pub mod nn;
pub mod optim;
pub mod tensor;
pub mod values;
