//! Loss functions for neural networks.

use crate::{
    error::{Result, TensorustError},
    nn::{init::cast, Loss},
    tensor::{Scalar, Tensor},
};
use serde::{Deserialize, Serialize};

/// How per-element losses are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reduction {
    /// Mean over every element of every output.
    #[default]
    Mean,
    /// Sum over every element of every output.
    Sum,
}

/// Mean Squared Error (MSE) loss function.
///
/// Over all outputs of a sequence, `sum((y - t)^2)`, divided by the total
/// element count under [`Reduction::Mean`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MSELoss {
    reduction: Reduction,
}

impl MSELoss {
    pub fn new(reduction: Reduction) -> Self {
        Self { reduction }
    }

    pub fn mean() -> Self {
        Self::new(Reduction::Mean)
    }

    pub fn sum() -> Self {
        Self::new(Reduction::Sum)
    }

    pub fn reduction(&self) -> Reduction {
        self.reduction
    }
}

fn check_pairs<T: Scalar>(outputs: &[Tensor<T>], targets: &[Tensor<T>]) -> Result<usize> {
    if outputs.is_empty() {
        return Err(TensorustError::InvalidInput(
            "loss needs at least one output".to_string(),
        ));
    }
    if outputs.len() != targets.len() {
        return Err(TensorustError::InvalidInput(format!(
            "{} outputs but {} targets",
            outputs.len(),
            targets.len()
        )));
    }
    let mut total = 0;
    for (output, target) in outputs.iter().zip(targets) {
        if output.len() != target.len() {
            return Err(TensorustError::length_mismatch(output.len(), target.len()));
        }
        total += output.len();
    }
    Ok(total)
}

impl<T: Scalar> Loss<T> for MSELoss {
    fn evaluate(&self, outputs: &mut [Tensor<T>], targets: &[Tensor<T>]) -> Result<T> {
        let total = check_pairs(outputs, targets)?;
        let scale: T = match self.reduction {
            Reduction::Mean => cast::<T>(total as f64)?.recip(),
            Reduction::Sum => T::one(),
        };
        let two = T::one() + T::one();

        let mut loss = T::zero();
        for (output, target) in outputs.iter_mut().zip(targets) {
            let grad: Vec<T> = output
                .data()
                .iter()
                .zip(target.data())
                .map(|(&y, &t)| {
                    let diff = y - t;
                    loss = loss + diff * diff;
                    two * diff * scale
                })
                .collect();
            output.set_grad(grad)?;
        }
        Ok(loss * scale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_mse_mean_seeds_gradients() {
        let mut outputs = vec![Tensor::from_slice(&[1.0f64, 2.0]), Tensor::from_slice(&[0.0, 0.0])];
        let targets = vec![Tensor::from_slice(&[0.0, 2.0]), Tensor::from_slice(&[1.0, -1.0])];

        let loss = MSELoss::mean().evaluate(&mut outputs, &targets).unwrap();
        assert_relative_eq!(loss, 3.0 / 4.0, epsilon = 1e-12);
        assert_eq!(outputs[0].grad(), Some(&[0.5, 0.0][..]));
        assert_eq!(outputs[1].grad(), Some(&[-0.5, 0.5][..]));
    }

    #[test]
    fn test_mse_sum() {
        let mut outputs = vec![Tensor::from_slice(&[3.0f32])];
        let targets = vec![Tensor::from_slice(&[1.0f32])];
        let loss = MSELoss::sum().evaluate(&mut outputs, &targets).unwrap();
        assert_relative_eq!(loss, 4.0);
        assert_eq!(outputs[0].grad(), Some(&[4.0f32][..]));
    }

    #[test]
    fn test_mse_rejects_bad_batches() {
        let loss = MSELoss::default();
        let mut none: Vec<Tensor<f64>> = Vec::new();
        assert!(loss.evaluate(&mut none, &[]).is_err());

        let mut outputs = vec![Tensor::from_slice(&[1.0f64])];
        assert!(loss.evaluate(&mut outputs, &[]).is_err());

        let targets = vec![Tensor::from_slice(&[1.0f64, 2.0])];
        assert!(loss.evaluate(&mut outputs, &targets).is_err());
        assert!(outputs[0].grad().is_none());
    }
}
