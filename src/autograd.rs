//! Explicit gradient computation, analogous to `torch.autograd.grad`
//!
//! Unlike [`Value::backward`], which accumulates into leaves, these functions return the
//! gradients. With `create_graph` they stay in the graph so they can be differentiated again.

use std::collections::HashSet;

use thiserror::Error;

use crate::{
    tensor::Tensor,
    values::{Value, enable_grad, no_grad, propagate},
};

/// Errors for gradient computation
#[derive(Debug, Error, PartialEq)]
pub enum AutogradError {
    #[error("Input {index} does not require grad and has no graph history")]
    NoGrad { index: usize },
    #[error("Input {index} was not used to compute the output (set allow_unused to skip it)")]
    Unused { index: usize },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GradOptions {
    /// Record the backward pass so the gradients can be differentiated again
    pub create_graph: bool,
    /// Return `None` for inputs the output does not depend on instead of failing
    pub allow_unused: bool,
}

/// Gradient of `output` with respect to each of `inputs`
pub fn grad(
    output: &Value,
    inputs: &[Value],
    options: GradOptions,
) -> Result<Vec<Option<Value>>, AutogradError> {
    if let Some(index) = inputs.iter().position(|v| !v.requires_grad()) {
        return Err(AutogradError::NoGrad { index });
    }
    let targets = inputs.iter().map(|v| v.id()).collect::<HashSet<_>>();
    let backprop = || propagate(output, Value::new(1.0), Some(&targets));
    let (_, adjoints) = if !output.requires_grad() {
        (vec![], Default::default())
    } else if options.create_graph {
        enable_grad(backprop)
    } else {
        no_grad(backprop)
    };

    let grads = inputs
        .iter()
        // an input listed twice gets the same gradient both times
        .map(|v| adjoints.get(&v.id()).cloned())
        .collect::<Vec<_>>();

    if !options.allow_unused {
        if let Some(index) = grads.iter().position(|g| g.is_none()) {
            return Err(AutogradError::Unused { index });
        }
    }
    Ok(grads)
}

/// Tensor form of [`grad`]. A tensor counts as used if any of its elements is; elements that
/// were not used get a zero gradient.
pub fn grad_tensors(
    output: &Value,
    inputs: &[Tensor],
    options: GradOptions,
) -> Result<Vec<Option<Tensor>>, AutogradError> {
    if let Some(index) = inputs.iter().position(|t| !t.requires_grad()) {
        return Err(AutogradError::NoGrad { index });
    }
    // frozen elements inside a tracked tensor are constants, not errors
    let flat = inputs
        .iter()
        .flat_map(|t| t.values().iter().filter(|v| v.requires_grad()).cloned())
        .collect::<Vec<_>>();
    let flat_grads = grad(
        output,
        &flat,
        GradOptions {
            allow_unused: true,
            ..options
        },
    )?;

    let mut flat_grads = flat_grads.into_iter();
    let mut grads = Vec::with_capacity(inputs.len());
    for (index, tensor) in inputs.iter().enumerate() {
        let mut used = false;
        let values = tensor
            .values()
            .iter()
            .map(|v| {
                let g = if v.requires_grad() {
                    flat_grads.next().flatten()
                } else {
                    None
                };
                used |= g.is_some();
                g.unwrap_or_else(|| Value::new(0.0))
            })
            .collect::<Vec<_>>();
        if !used {
            if !options.allow_unused {
                return Err(AutogradError::Unused { index });
            }
            grads.push(None);
            continue;
        }
        grads.push(Some(tensor.with_values(values)));
    }
    Ok(grads)
}
