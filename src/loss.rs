//! Loss function(s)

use crate::{
    tensor::{Tensor, TensorError},
    values::Value,
};

/// Mean Squared Error Loss between two vectors of values
pub struct MSELoss;

impl MSELoss {
    pub fn call<T, U>(y_pred: &[T], y_true: &[U]) -> Value
    where
        T: AsRef<Value>,
        U: AsRef<Value>,
    {
        let loss = y_pred
            .iter()
            .zip(y_true.iter())
            .map(|(a, b)| (a.as_ref() - b.as_ref()).powf(2.0))
            .sum::<Value>();
        loss / Value::new(y_pred.len() as f32)
    }

    /// Mean over all elements, the shapes must match
    pub fn tensors(y_pred: &Tensor, y_true: &Tensor) -> Result<Value, TensorError> {
        if y_pred.shape() != y_true.shape() {
            return Err(TensorError::IncompatibleShapes {
                lhs: y_pred.shape().to_vec(),
                rhs: y_true.shape().to_vec(),
            });
        }
        Ok(Self::call(y_pred.values(), y_true.values()))
    }
}
