//! Core tensor type shared by every layer.
//!
//! A `Tensor` is a passive value: a dense batch-major buffer, an optional
//! gradient buffer of the same length, the per-sample shape and the batch
//! count. It may also carry a [`Producer`] back-reference naming the
//! operation that created it, which is only consulted to continue a backward
//! pass past a layer boundary.

use crate::{
    autodiff::Producer,
    error::{Result, TensorustError},
};
use num_traits::Float;
use std::fmt::Debug;

/// Element types a tensor can hold.
pub trait Scalar: Float + Debug + 'static {}

impl<T: Float + Debug + 'static> Scalar for T {}

/// A dense batch of samples sharing one per-sample shape.
///
/// `data.len() == batch_count * shape.iter().product()` always holds, and a
/// gradient buffer, once allocated, has the same length.
#[derive(Debug, Clone)]
pub struct Tensor<T> {
    data: Vec<T>,
    grad: Option<Vec<T>>,
    shape: Vec<usize>,
    batch_count: usize,
    producer: Option<Producer<T>>,
}

impl<T: Scalar> Tensor<T> {
    /// Creates a tensor from batch-major data.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch count is zero or the data length does not
    /// match `batch_count * product(shape)`.
    pub fn new(data: Vec<T>, shape: impl Into<Vec<usize>>, batch_count: usize) -> Result<Self> {
        let shape = shape.into();
        if batch_count == 0 {
            return Err(TensorustError::InvalidInput(
                "batch count must be at least 1".to_string(),
            ));
        }
        let expected = shape.iter().product::<usize>() * batch_count;
        if data.len() != expected {
            return Err(TensorustError::length_mismatch(expected, data.len()));
        }
        Ok(Self {
            data,
            grad: None,
            shape,
            batch_count,
            producer: None,
        })
    }

    /// Creates a single-sample tensor whose shape is `[data.len()]`.
    pub fn from_slice(data: &[T]) -> Self {
        Self {
            data: data.to_vec(),
            grad: None,
            shape: vec![data.len()],
            batch_count: 1,
            producer: None,
        }
    }

    /// Creates a zero-filled tensor.
    pub fn zeros(shape: impl Into<Vec<usize>>, batch_count: usize) -> Result<Self> {
        let shape = shape.into();
        let len = shape.iter().product::<usize>() * batch_count;
        Self::new(vec![T::zero(); len], shape, batch_count)
    }

    /// Attaches a gradient buffer, replacing any existing one.
    pub fn with_grad(mut self, grad: Vec<T>) -> Result<Self> {
        self.set_grad(grad)?;
        Ok(self)
    }

    /// Tags the tensor with the operation that produced it.
    pub fn with_producer(mut self, producer: Producer<T>) -> Self {
        self.producer = Some(producer);
        self
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<T> {
        self.data
    }

    pub fn grad(&self) -> Option<&[T]> {
        self.grad.as_deref()
    }

    /// Returns the gradient buffer, allocating a zeroed one on first use.
    pub fn grad_mut(&mut self) -> &mut [T] {
        let len = self.data.len();
        self.grad.get_or_insert_with(|| vec![T::zero(); len])
    }

    /// Replaces the gradient buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if `grad` does not have the same length as the data.
    pub fn set_grad(&mut self, grad: Vec<T>) -> Result<()> {
        if grad.len() != self.data.len() {
            return Err(TensorustError::length_mismatch(self.data.len(), grad.len()));
        }
        self.grad = Some(grad);
        Ok(())
    }

    /// Adds `grad` elementwise into the gradient buffer.
    pub fn accumulate_grad(&mut self, grad: &[T]) -> Result<()> {
        if grad.len() != self.data.len() {
            return Err(TensorustError::length_mismatch(self.data.len(), grad.len()));
        }
        for (g, &d) in self.grad_mut().iter_mut().zip(grad) {
            *g = *g + d;
        }
        Ok(())
    }

    pub fn clear_grad(&mut self) {
        self.grad = None;
    }

    /// Per-sample shape; the batch axis is not included.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn batch_count(&self) -> usize {
        self.batch_count
    }

    /// Number of values in one sample.
    pub fn sample_len(&self) -> usize {
        self.shape.iter().product()
    }

    /// Total number of values across the batch.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Values of batch slot `index`.
    pub fn sample(&self, index: usize) -> Option<&[T]> {
        let len = self.sample_len();
        self.data.get(index * len..(index + 1) * len)
    }

    pub fn producer(&self) -> Option<&Producer<T>> {
        self.producer.as_ref()
    }

    /// Drops the producer reference so backward cannot continue past this tensor.
    pub fn detach(mut self) -> Self {
        self.producer = None;
        self
    }
}
