//! Vector-Jacobian products for backprop
//!
//! Applied depending on the operation which created outputs from inputs. Corresponds to
//! a node in the computation graph. Every rule is written with [`Value`] arithmetic, so when
//! graph recording is enabled the gradients are themselves differentiable.

use crate::values::Value;

/// Represents the function in the computation graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpropFunc {
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    Pow,
    ReLU,
    Exp,
    Ln,
    Sqrt,
    Sigmoid,
    Tanh,
    Identity,
}

impl BackpropFunc {
    pub fn n_operands(&self) -> usize {
        match self {
            BackpropFunc::Add
            | BackpropFunc::Sub
            | BackpropFunc::Mul
            | BackpropFunc::Div
            | BackpropFunc::Pow => 2,
            BackpropFunc::Neg
            | BackpropFunc::ReLU
            | BackpropFunc::Exp
            | BackpropFunc::Ln
            | BackpropFunc::Sqrt
            | BackpropFunc::Sigmoid
            | BackpropFunc::Tanh
            | BackpropFunc::Identity => 1,
        }
    }
}

/// Represents backprop for the operation `in1 * in2 = out`
pub fn mul(in1: &Value, in2: &Value, grad: &Value) -> (Value, Value) {
    (grad * in2, grad * in1)
}

/// Represents backprop for the operation `in1 / in2 = out`
pub fn div(in1: &Value, in2: &Value, grad: &Value) -> (Value, Value) {
    let d_in1 = grad / in2;
    let d_in2 = -&(&(grad * in1) / &(in2 * in2));
    (d_in1, d_in2)
}

/// Represents backprop for the operation `in1^in2 = out`
/// only support numerical float powers, da^b/db is only defined for positive a, so gradient is
/// not calculated for the exponent
pub fn pow(in1: &Value, in2: &Value, grad: &Value) -> Value {
    let exponent = in2.detach();
    let reduced = &exponent - &Value::new(1.0);
    &(grad * &exponent) * &in1.pow(&reduced)
}

/// Represents backprop for the operation `relu(in) = out`
/// The mask is a constant, relu has no curvature
pub fn relu(in1: &Value, grad: &Value) -> Value {
    let mask = Value::new(if in1.data() > 0.0 { 1.0 } else { 0.0 });
    grad * &mask
}

/// Represents backprop for the operation `exp(in) = out`
pub fn exp(out: &Value, grad: &Value) -> Value {
    grad * out
}

/// Represents backprop for the operation `ln(in) = out`
pub fn ln(in1: &Value, grad: &Value) -> Value {
    grad / in1
}

/// Represents backprop for the operation `sqrt(in) = out`
/// At `in = 0` the subgradient 0 is used, so the L2 norm of a zero tensor has a zero gradient
pub fn sqrt(out: &Value, grad: &Value) -> Value {
    if out.data() == 0.0 {
        return Value::new(0.0);
    }
    grad / &(out * &Value::new(2.0))
}

/// Represents backprop for the operation `sigmoid(in) = out`
pub fn sigmoid(out: &Value, grad: &Value) -> Value {
    &(grad * out) * &(&Value::new(1.0) - out)
}

/// Represents backprop for the operation `tanh(in) = out`
pub fn tanh(out: &Value, grad: &Value) -> Value {
    grad * &(&Value::new(1.0) - &(out * out))
}

/// Returns the contribution of `grad` (the adjoint of `out`) to each operand of `out`.
/// Operands whose entry in `wanted` is `false` are skipped and get `None`.
pub fn vector_jacobian(
    backprop_fn: BackpropFunc,
    operands: &[Value],
    out: &Value,
    grad: &Value,
    wanted: &[bool],
) -> Vec<Option<Value>> {
    let want = |i: usize| wanted.get(i).copied().unwrap_or(false);
    match (backprop_fn, operands) {
        (BackpropFunc::Add, [_, _]) => {
            vec![want(0).then(|| grad.clone()), want(1).then(|| grad.clone())]
        }
        (BackpropFunc::Sub, [_, _]) => vec![want(0).then(|| grad.clone()), want(1).then(|| -grad)],
        (BackpropFunc::Mul, [in1, in2]) => {
            if want(0) && want(1) {
                let (d1, d2) = mul(in1, in2, grad);
                vec![Some(d1), Some(d2)]
            } else {
                vec![want(0).then(|| grad * in2), want(1).then(|| grad * in1)]
            }
        }
        (BackpropFunc::Div, [in1, in2]) => {
            if want(1) {
                let (d1, d2) = div(in1, in2, grad);
                vec![want(0).then_some(d1), Some(d2)]
            } else {
                vec![want(0).then(|| grad / in2), None]
            }
        }
        (BackpropFunc::Pow, [in1, in2]) => vec![want(0).then(|| pow(in1, in2, grad)), None],
        (BackpropFunc::Neg, [_]) => vec![want(0).then(|| -grad)],
        (BackpropFunc::ReLU, [in1]) => vec![want(0).then(|| relu(in1, grad))],
        (BackpropFunc::Exp, [_]) => vec![want(0).then(|| exp(out, grad))],
        (BackpropFunc::Ln, [in1]) => vec![want(0).then(|| ln(in1, grad))],
        (BackpropFunc::Sqrt, [_]) => vec![want(0).then(|| sqrt(out, grad))],
        (BackpropFunc::Sigmoid, [_]) => vec![want(0).then(|| sigmoid(out, grad))],
        (BackpropFunc::Tanh, [_]) => vec![want(0).then(|| tanh(out, grad))],
        (BackpropFunc::Identity, [_]) => vec![want(0).then(|| grad.clone())],
        _ => panic!(
            "{:?} expects {} operands, got {}",
            backprop_fn,
            backprop_fn.n_operands(),
            operands.len()
        ),
    }
}
