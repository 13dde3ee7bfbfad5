//! Neural network building blocks.
//! This module provides the layer, loss and optimizer interfaces plus the
//! concrete layers, losses, optimizers and trainer built on them.

mod activations;
mod init;
mod layers;
mod losses;
mod optimizers;
mod trainer;

pub use activations::*;
pub use init::*;
pub use layers::*;
pub use losses::*;
pub use optimizers::*;
pub use trainer::*;

use crate::{
    error::{Result, TensorustError},
    tensor::{Scalar, Tensor},
};

/// A trainable buffer with its accumulated gradient.
#[derive(Debug, Clone)]
pub struct Parameter<T> {
    name: String,
    data: Vec<T>,
    grad: Vec<T>,
    shape: Vec<usize>,
}

impl<T: Scalar> Parameter<T> {
    /// Creates a parameter with a zeroed gradient.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` does not hold `product(shape)` values.
    pub fn new(name: impl Into<String>, data: Vec<T>, shape: impl Into<Vec<usize>>) -> Result<Self> {
        let shape = shape.into();
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(TensorustError::ShapeMismatch {
                expected: shape,
                actual: vec![data.len()],
            });
        }
        Ok(Self {
            name: name.into(),
            grad: vec![T::zero(); data.len()],
            data,
            shape,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn grad(&self) -> &[T] {
        &self.grad
    }

    pub fn grad_mut(&mut self) -> &mut [T] {
        &mut self.grad
    }

    /// Mutable data and gradient at once, for optimizer updates.
    pub fn split_mut(&mut self) -> (&mut [T], &[T]) {
        (&mut self.data, &self.grad)
    }

    pub fn zero_grad(&mut self) {
        self.grad.iter_mut().for_each(|g| *g = T::zero());
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Trait for all neural network layers.
///
/// Forward and backward calls pair up in last-in first-out order: each
/// `backward` consumes what the most recent unmatched `forward` recorded.
pub trait Layer<T: Scalar> {
    /// Forward pass, recording what the matching backward needs.
    fn forward(&mut self, input: &Tensor<T>) -> Result<Tensor<T>>;

    /// Backward pass for the most recent unmatched forward call.
    ///
    /// Reads the gradient from `output.grad()`, accumulates parameter
    /// gradients and returns the gradient with respect to that call's input.
    fn backward(&mut self, output: &Tensor<T>) -> Result<Vec<T>>;

    /// Forward pass that records nothing.
    fn predict(&mut self, input: &Tensor<T>) -> Result<Tensor<T>>;

    /// Clears any state kept between calls.
    fn reset_state(&mut self) {}

    fn parameters(&self) -> Vec<&Parameter<T>>;

    fn parameters_mut(&mut self) -> Vec<&mut Parameter<T>>;

    fn zero_grad(&mut self) {
        for p in self.parameters_mut() {
            p.zero_grad();
        }
    }

    fn parameter_count(&self) -> usize {
        self.parameters().iter().map(|p| p.len()).sum()
    }
}

/// Trait for loss functions.
pub trait Loss<T: Scalar> {
    /// Computes the loss over all output/target pairs and seeds each
    /// output's gradient buffer with the derivative of the loss.
    fn evaluate(&self, outputs: &mut [Tensor<T>], targets: &[Tensor<T>]) -> Result<T>;
}

/// Trait for optimization algorithms.
pub trait Optimizer<T: Scalar> {
    /// Update the parameters using their accumulated gradients.
    fn step(&mut self, params: &mut [&mut Parameter<T>]) -> Result<()>;

    fn lr(&self) -> f64;

    fn set_lr(&mut self, lr: f64);
}

/// A sequential container for layers.
///
/// Each forward call keeps the intermediate outputs so the matching backward
/// call can hand every layer a gradient-carrying tensor.
pub struct Sequential<T> {
    layers: Vec<Box<dyn Layer<T>>>,
    intermediates: Vec<Vec<Tensor<T>>>,
}

impl<T: Scalar> Sequential<T> {
    /// Create a new sequential container.
    pub fn new() -> Self {
        Self {
            layers: Vec::new(),
            intermediates: Vec::new(),
        }
    }

    /// Add a layer to the container.
    pub fn add<L>(mut self, layer: L) -> Self
    where
        L: Layer<T> + 'static,
    {
        self.layers.push(Box::new(layer));
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Number of forward calls not yet matched by backward.
    pub fn pending_depth(&self) -> usize {
        self.intermediates.len()
    }
}

impl<T: Scalar> Default for Sequential<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Scalar> Layer<T> for Sequential<T> {
    fn forward(&mut self, input: &Tensor<T>) -> Result<Tensor<T>> {
        let Some((last, rest)) = self.layers.split_last_mut() else {
            return Ok(input.clone());
        };
        let mut kept = Vec::with_capacity(rest.len());
        let mut current = input.clone();
        for layer in rest.iter_mut() {
            current = layer.forward(&current)?;
            kept.push(current.clone());
        }
        let output = last.forward(&current)?;
        self.intermediates.push(kept);
        Ok(output)
    }

    fn backward(&mut self, output: &Tensor<T>) -> Result<Vec<T>> {
        let Some((last, rest)) = self.layers.split_last_mut() else {
            return output
                .grad()
                .map(<[T]>::to_vec)
                .ok_or(TensorustError::MissingGradient);
        };
        let mut kept = self
            .intermediates
            .pop()
            .ok_or_else(|| TensorustError::NoPendingForward {
                layer: "Sequential".to_string(),
            })?;
        let mut grad = last.backward(output)?;
        for layer in rest.iter_mut().rev() {
            let mut carrier = kept.pop().ok_or_else(|| TensorustError::NoPendingForward {
                layer: "Sequential".to_string(),
            })?;
            carrier.set_grad(grad)?;
            grad = layer.backward(&carrier)?;
        }
        Ok(grad)
    }

    fn predict(&mut self, input: &Tensor<T>) -> Result<Tensor<T>> {
        let mut current = input.clone();
        for layer in &mut self.layers {
            current = layer.predict(&current)?;
        }
        Ok(current)
    }

    fn reset_state(&mut self) {
        self.intermediates.clear();
        for layer in &mut self.layers {
            layer.reset_state();
        }
    }

    fn parameters(&self) -> Vec<&Parameter<T>> {
        self.layers.iter().flat_map(|l| l.parameters()).collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter<T>> {
        self.layers
            .iter_mut()
            .flat_map(|l| l.parameters_mut())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DenseConfig;

    #[test]
    fn test_parameter_shape_checked() {
        assert!(Parameter::<f32>::new("w", vec![0.0; 6], vec![2, 3]).is_ok());
        assert!(Parameter::<f32>::new("w", vec![0.0; 5], vec![2, 3]).is_err());
    }

    #[test]
    fn test_sequential_chains_dense_layers() {
        let a = DenseLayer::<f64>::from_weights(vec![1.0, 2.0, 3.0, 4.0], Some(vec![0.0, 0.0]), 2, 2).unwrap();
        let b = DenseLayer::<f64>::from_weights(vec![1.0, -1.0], None, 2, 1).unwrap();
        let mut model = Sequential::new().add(a).add(b);

        let x = Tensor::from_slice(&[1.0, 1.0]);
        // a: [3, 7]; b: 3 - 7
        let mut y = model.forward(&x).unwrap();
        assert_eq!(y.data(), &[-4.0]);
        assert_eq!(model.pending_depth(), 1);

        y.set_grad(vec![1.0]).unwrap();
        let dx = model.backward(&y).unwrap();
        // d/dx of (x0 + 2x1) - (3x0 + 4x1)
        assert_eq!(dx, vec![-2.0, -2.0]);
        assert_eq!(model.pending_depth(), 0);
        assert!(model.backward(&y).is_err());
    }

    #[test]
    fn test_sequential_parameters() {
        let model = Sequential::<f32>::new()
            .add(DenseLayer::new(&DenseConfig::new(3, 4).with_seed(1)).unwrap())
            .add(DenseLayer::new(&DenseConfig::new(4, 1).with_bias(false).with_seed(2)).unwrap());
        assert_eq!(model.parameters().len(), 3);
        assert_eq!(model.parameter_count(), 3 * 4 + 4 + 4);
    }
}
