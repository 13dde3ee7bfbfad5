//! Optimization algorithms for training neural networks.
//!
//! Optimizers keep per-parameter state by position, so they must see the
//! same parameter list, in the same order, on every step.
//!
//! - [`SGD`]: stochastic gradient descent with optional momentum
//! - [`Adam`]: adaptive moment estimation

use crate::{
    error::{Result, TensorustError},
    nn::{init::cast, Optimizer, Parameter},
    tensor::Scalar,
};

fn check_state_len<T>(state: &[Vec<T>], params: &[&mut Parameter<T>]) -> Result<()>
where
    T: Scalar,
{
    if state.len() != params.len() || state.iter().zip(params.iter()).any(|(s, p)| s.len() != p.len()) {
        return Err(TensorustError::InvalidInput(
            "optimizer state does not match the parameter list".to_string(),
        ));
    }
    Ok(())
}

/// Stochastic gradient descent: `v = momentum * v + g; p -= lr * v`.
#[derive(Debug, Clone)]
pub struct SGD<T> {
    lr: f64,
    momentum: f64,
    velocity: Vec<Vec<T>>,
}

impl<T: Scalar> SGD<T> {
    pub fn new(lr: f64) -> Self {
        Self::with_momentum(lr, 0.0)
    }

    pub fn with_momentum(lr: f64, momentum: f64) -> Self {
        Self {
            lr,
            momentum,
            velocity: Vec::new(),
        }
    }

    pub fn momentum(&self) -> f64 {
        self.momentum
    }
}

impl<T: Scalar> Optimizer<T> for SGD<T> {
    fn step(&mut self, params: &mut [&mut Parameter<T>]) -> Result<()> {
        let lr: T = cast(self.lr)?;
        let momentum: T = cast(self.momentum)?;
        if self.velocity.is_empty() {
            self.velocity = params.iter().map(|p| vec![T::zero(); p.len()]).collect();
        }
        check_state_len(&self.velocity, params)?;

        for (param, velocity) in params.iter_mut().zip(&mut self.velocity) {
            let (data, grad) = param.split_mut();
            for ((w, &g), v) in data.iter_mut().zip(grad).zip(velocity.iter_mut()) {
                *v = momentum * *v + g;
                *w = *w - lr * *v;
            }
        }
        Ok(())
    }

    fn lr(&self) -> f64 {
        self.lr
    }

    fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
    }
}

/// Adam optimizer with bias-corrected first and second moments.
#[derive(Debug, Clone)]
pub struct Adam<T> {
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    t: i32,
    m: Vec<Vec<T>>,
    v: Vec<Vec<T>>,
}

impl<T: Scalar> Adam<T> {
    /// Adam with the usual defaults `beta1 = 0.9`, `beta2 = 0.999`, `eps = 1e-8`.
    pub fn new(lr: f64) -> Self {
        Self::with_betas(lr, 0.9, 0.999, 1e-8)
    }

    pub fn with_betas(lr: f64, beta1: f64, beta2: f64, eps: f64) -> Self {
        Self {
            lr,
            beta1,
            beta2,
            eps,
            t: 0,
            m: Vec::new(),
            v: Vec::new(),
        }
    }

    /// Steps taken so far.
    pub fn steps(&self) -> i32 {
        self.t
    }
}

impl<T: Scalar> Optimizer<T> for Adam<T> {
    fn step(&mut self, params: &mut [&mut Parameter<T>]) -> Result<()> {
        if self.m.is_empty() {
            self.m = params.iter().map(|p| vec![T::zero(); p.len()]).collect();
            self.v = self.m.clone();
        }
        check_state_len(&self.m, params)?;

        self.t += 1;
        let beta1: T = cast(self.beta1)?;
        let beta2: T = cast(self.beta2)?;
        let eps: T = cast(self.eps)?;
        let lr: T = cast(self.lr)?;
        let correction1 = T::one() - beta1.powi(self.t);
        let correction2 = T::one() - beta2.powi(self.t);

        for ((param, m), v) in params.iter_mut().zip(&mut self.m).zip(&mut self.v) {
            let (data, grad) = param.split_mut();
            for (k, (w, &g)) in data.iter_mut().zip(grad).enumerate() {
                m[k] = beta1 * m[k] + (T::one() - beta1) * g;
                v[k] = beta2 * v[k] + (T::one() - beta2) * g * g;
                let m_hat = m[k] / correction1;
                let v_hat = v[k] / correction2;
                *w = *w - lr * m_hat / (v_hat.sqrt() + eps);
            }
        }
        Ok(())
    }

    fn lr(&self) -> f64 {
        self.lr
    }

    fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn param(values: &[f64], grads: &[f64]) -> Parameter<f64> {
        let mut p = Parameter::new("p", values.to_vec(), vec![values.len()]).unwrap();
        p.grad_mut().copy_from_slice(grads);
        p
    }

    #[test]
    fn test_sgd_step() {
        let mut p = param(&[1.0, 2.0], &[0.5, -1.0]);
        let mut opt = SGD::new(0.1);
        opt.step(&mut [&mut p]).unwrap();
        assert_relative_eq!(p.data()[0], 0.95, epsilon = 1e-12);
        assert_relative_eq!(p.data()[1], 2.1, epsilon = 1e-12);
    }

    #[test]
    fn test_sgd_momentum_accumulates() {
        let mut p = param(&[0.0], &[1.0]);
        let mut opt = SGD::with_momentum(1.0, 0.5);
        opt.step(&mut [&mut p]).unwrap();
        opt.step(&mut [&mut p]).unwrap();
        // v1 = 1, v2 = 1.5
        assert_relative_eq!(p.data()[0], -2.5, epsilon = 1e-12);
    }

    #[test]
    fn test_adam_first_step_moves_by_lr() {
        let mut p = param(&[1.0, 1.0], &[3.0, -0.01]);
        let mut opt = Adam::new(0.01);
        opt.step(&mut [&mut p]).unwrap();
        assert_relative_eq!(p.data()[0], 0.99, epsilon = 1e-6);
        assert_relative_eq!(p.data()[1], 1.01, epsilon = 1e-5);
        assert_eq!(opt.steps(), 1);
    }

    #[test]
    fn test_state_mismatch_rejected() {
        let mut a = param(&[1.0], &[1.0]);
        let mut b = param(&[1.0, 2.0], &[1.0, 1.0]);
        let mut opt = SGD::new(0.1);
        opt.step(&mut [&mut a]).unwrap();
        assert!(opt.step(&mut [&mut b]).is_err());
    }
}
