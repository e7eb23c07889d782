//! Shaped, row-major collections of [`Value`]s
//!
//! A tensor is a thin container: every element is its own node in the computation graph.
//! `Clone` aliases the same nodes (like assigning a tensor in PyTorch), [`Tensor::identity`]
//! creates a graph-linked copy and [`Tensor::detach`] an unlinked one.

use rand::Rng;
use rand_distr::{Distribution, Normal};
use thiserror::Error;

use crate::values::Value;

/// Errors for tensor construction and arithmetic
#[derive(Debug, Error, PartialEq)]
pub enum TensorError {
    #[error("Shape {shape:?} holds {expected} elements, got {got}")]
    ShapeMismatch {
        shape: Vec<usize>,
        expected: usize,
        got: usize,
    },
    #[error("Incompatible shapes {lhs:?} and {rhs:?}")]
    IncompatibleShapes { lhs: Vec<usize>, rhs: Vec<usize> },
    #[error("Expected a {expected}-d tensor, got shape {shape:?}")]
    Rank { expected: usize, shape: Vec<usize> },
    #[error("Only leaf tensors can change requires_grad")]
    NonLeaf,
    #[error("Invalid standard deviation {0}")]
    InvalidStd(f32),
}

#[derive(Debug, Clone)]
pub struct Tensor {
    values: Vec<Value>,
    shape: Vec<usize>,
}

impl Tensor {
    pub fn new(values: Vec<Value>, shape: &[usize]) -> Result<Self, TensorError> {
        let expected = shape.iter().product::<usize>();
        if values.len() != expected {
            return Err(TensorError::ShapeMismatch {
                shape: shape.to_vec(),
                expected,
                got: values.len(),
            });
        }
        Ok(Self {
            values,
            shape: shape.to_vec(),
        })
    }

    /// Constant tensor (does not require grad)
    pub fn from_vec(data: Vec<f32>, shape: &[usize]) -> Result<Self, TensorError> {
        Self::new(data.into_iter().map(Value::new).collect(), shape)
    }

    /// Leaf tensor which accumulates gradients
    pub fn parameter(data: Vec<f32>, shape: &[usize]) -> Result<Self, TensorError> {
        Self::new(data.into_iter().map(Value::variable).collect(), shape)
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self::full(shape, 0.0, false)
    }

    pub fn full(shape: &[usize], fill: f32, requires_grad: bool) -> Self {
        let n = shape.iter().product::<usize>();
        Self {
            values: (0..n).map(|_| Value::leaf(fill, requires_grad)).collect(),
            shape: shape.to_vec(),
        }
    }

    /// Leaf tensor with elements drawn from N(0, std^2)
    pub fn randn<R: Rng + ?Sized>(
        shape: &[usize],
        std: f32,
        requires_grad: bool,
        rng: &mut R,
    ) -> Result<Self, TensorError> {
        let normal = Normal::new(0.0, std).map_err(|_| TensorError::InvalidStd(std))?;
        let n = shape.iter().product::<usize>();
        Ok(Self {
            values: (0..n)
                .map(|_| Value::leaf(normal.sample(rng), requires_grad))
                .collect(),
            shape: shape.to_vec(),
        })
    }

    /// A tensor of this shape holding `values`
    pub(crate) fn with_values(&self, values: Vec<Value>) -> Tensor {
        debug_assert_eq!(values.len(), self.values.len());
        Tensor {
            values,
            shape: self.shape.clone(),
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn data(&self) -> Vec<f32> {
        self.values.iter().map(|v| v.data()).collect()
    }

    /// Accumulated gradient, `None` if no element has received one
    pub fn grad(&self) -> Option<Vec<f32>> {
        if self.values.iter().all(|v| v.grad().is_none()) {
            return None;
        }
        Some(
            self.values
                .iter()
                .map(|v| v.grad().unwrap_or(0.0))
                .collect(),
        )
    }

    pub fn requires_grad(&self) -> bool {
        self.values.iter().any(|v| v.requires_grad())
    }

    pub fn is_leaf(&self) -> bool {
        self.values.iter().all(|v| v.is_leaf())
    }

    /// Toggles gradient tracking. As the elements are shared, this affects every alias.
    pub fn set_requires_grad(&self, requires_grad: bool) -> Result<(), TensorError> {
        if !self.is_leaf() {
            return Err(TensorError::NonLeaf);
        }
        for v in self.values.iter() {
            v.set_requires_grad(requires_grad);
        }
        Ok(())
    }

    pub fn zero_grad(&mut self) {
        for v in self.values.iter_mut() {
            v.zero_grad();
        }
    }

    /// Overwrites the data of the elements in place, outside of the graph
    pub fn set_data(&mut self, data: &[f32]) -> Result<(), TensorError> {
        if data.len() != self.values.len() {
            return Err(TensorError::ShapeMismatch {
                shape: self.shape.clone(),
                expected: self.values.len(),
                got: data.len(),
            });
        }
        for (v, d) in self.values.iter_mut().zip(data) {
            v.set_data(*d);
        }
        Ok(())
    }

    pub fn detach(&self) -> Tensor {
        self.map(|v| v.detach())
    }

    /// Same data, new nodes which point back to these ones
    pub fn identity(&self) -> Tensor {
        self.map(|v| v.identity())
    }

    pub fn map<F>(&self, f: F) -> Tensor
    where
        F: FnMut(&Value) -> Value,
    {
        Tensor {
            values: self.values.iter().map(f).collect(),
            shape: self.shape.clone(),
        }
    }

    pub fn zip_with<F>(&self, other: &Tensor, mut f: F) -> Result<Tensor, TensorError>
    where
        F: FnMut(&Value, &Value) -> Value,
    {
        if self.shape != other.shape {
            return Err(TensorError::IncompatibleShapes {
                lhs: self.shape.clone(),
                rhs: other.shape.clone(),
            });
        }
        Ok(Tensor {
            values: self
                .values
                .iter()
                .zip(other.values.iter())
                .map(|(a, b)| f(a, b))
                .collect(),
            shape: self.shape.clone(),
        })
    }

    pub fn add(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        self.zip_with(other, |a, b| a + b)
    }

    pub fn sub(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        self.zip_with(other, |a, b| a - b)
    }

    pub fn mul(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        self.zip_with(other, |a, b| a * b)
    }

    pub fn scale(&self, factor: &Value) -> Tensor {
        self.map(|v| v * factor)
    }

    pub fn sum(&self) -> Value {
        self.values.iter().cloned().sum()
    }

    /// L2 norm over all elements, with a zero gradient at the zero tensor
    pub fn norm(&self) -> Value {
        self.values.iter().map(|v| v * v).sum::<Value>().sqrt()
    }

    pub fn relu(&self) -> Tensor {
        self.map(|v| v.relu())
    }

    pub fn sigmoid(&self) -> Tensor {
        self.map(|v| v.sigmoid())
    }

    pub fn tanh(&self) -> Tensor {
        self.map(|v| v.tanh())
    }

    /// Number of rows and columns of a 2-d tensor
    pub fn dims2(&self) -> Result<(usize, usize), TensorError> {
        match self.shape.as_slice() {
            [rows, cols] => Ok((*rows, *cols)),
            _ => Err(TensorError::Rank {
                expected: 2,
                shape: self.shape.clone(),
            }),
        }
    }

    pub fn rows(&self) -> Result<impl Iterator<Item = &[Value]>, TensorError> {
        let (_, cols) = self.dims2()?;
        Ok(self.values.chunks(cols.max(1)))
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.shape == other.shape && self.values == other.values
    }
}
