//! Copies and updates module trees while keeping them in the computation graph
//!
//! Every function here walks the tree leaves first: children are rebuilt before their parent,
//! then each direct tensor of the parent is mapped to its new version and the parent is put
//! back together with [`Module::rebuild`]. Tensors are matched by their name path, so the
//! result always lines up with [`Module::named_parameters`] of the source.

use std::collections::HashMap;

use crate::{
    nn::{Module, ModuleParts, NNError},
    tensor::Tensor,
    values::is_grad_enabled,
};

/// Whether a tensor is a parameter or a buffer of its module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorKind {
    Parameter,
    Buffer,
}

/// Rebuilds `module` with every direct parameter and buffer replaced by `f(path, kind, tensor)`
pub fn map_module<F>(module: &dyn Module, f: &mut F) -> Result<Box<dyn Module>, NNError>
where
    F: FnMut(&str, TensorKind, &Tensor) -> Tensor,
{
    map_module_at(module, "", f)
}

fn map_module_at<F>(module: &dyn Module, prefix: &str, f: &mut F) -> Result<Box<dyn Module>, NNError>
where
    F: FnMut(&str, TensorKind, &Tensor) -> Tensor,
{
    let path = |name: &str| {
        if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{prefix}.{name}")
        }
    };

    let mut parts = ModuleParts::new();
    for (name, child) in module.children() {
        let rebuilt = map_module_at(child, &path(&name), f)?;
        parts.insert_child(name, rebuilt);
    }
    for (name, tensor) in module.direct_parameters() {
        let mapped = f(&path(&name), TensorKind::Parameter, &tensor);
        parts.insert_parameter(name, mapped);
    }
    for (name, tensor) in module.direct_buffers() {
        let mapped = f(&path(&name), TensorKind::Buffer, &tensor);
        parts.insert_buffer(name, mapped);
    }
    module.rebuild(parts)
}

/// The clone-update primitive: a copy of `tensor` equal in value.
///
/// The copy is graph-linked (gradients flow from it back into `tensor`) when `tensor` requires
/// grad, recording is enabled and `in_no_grad` is not set. Otherwise it is a detached copy.
pub fn clone_tensor(tensor: &Tensor, in_no_grad: bool) -> Tensor {
    if !in_no_grad && is_grad_enabled() && tensor.requires_grad() {
        tensor.identity()
    } else {
        tensor.detach()
    }
}

/// Applies [`clone_tensor`] to each tensor of a flat list, e.g. learnable learning rates
pub fn clone_parameters(tensors: &[Tensor]) -> Vec<Tensor> {
    tensors.iter().map(|t| clone_tensor(t, false)).collect()
}

/// A structurally identical copy of `module` whose parameters are graph-linked to the source.
///
/// Parameters that do not require grad and all buffers are copied without graph linkage.
/// Right after cloning, the clone computes exactly the same outputs as the source.
pub fn clone_module(module: &dyn Module) -> Result<Box<dyn Module>, NNError> {
    let mut n_linked = 0;
    let clone = map_module(module, &mut |_, kind, tensor| match kind {
        TensorKind::Parameter => {
            let cloned = clone_tensor(tensor, false);
            if cloned.requires_grad() {
                n_linked += 1;
            }
            cloned
        }
        TensorKind::Buffer => clone_tensor(tensor, true),
    })?;
    log::debug!(
        "cloned {} with {} graph-linked parameters",
        module.name(),
        n_linked
    );
    Ok(clone)
}

/// Rebuilds `module` with the parameters named in `updates` swapped for the given tensors.
///
/// Parameters without an entry, and all buffers, are carried over unchanged (the same nodes),
/// so anything already computed from the old tensors still refers to them.
pub fn update_module(
    module: &dyn Module,
    updates: &HashMap<String, Tensor>,
) -> Result<Box<dyn Module>, NNError> {
    map_module(module, &mut |path, kind, tensor| match kind {
        TensorKind::Parameter => updates.get(path).unwrap_or(tensor).clone(),
        TensorKind::Buffer => tensor.clone(),
    })
}

/// A copy of `module` cut out of the graph: every tensor is detached, and parameters that
/// required grad become fresh leaves which require grad again.
pub fn detach_module(module: &dyn Module) -> Result<Box<dyn Module>, NNError> {
    let mut failed = None;
    let detached = map_module(module, &mut |_, kind, tensor| {
        let detached = tensor.detach();
        if kind == TensorKind::Parameter && tensor.requires_grad() {
            if let Err(e) = detached.set_requires_grad(true) {
                failed = Some(e);
            }
        }
        detached
    })?;
    match failed {
        Some(e) => Err(e.into()),
        None => Ok(detached),
    }
}
