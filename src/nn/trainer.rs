//! Incremental (online) training over short sequences.
//!
//! One update feeds a whole sequence through a stateful model, evaluates
//! the loss over every output, then runs backward over the outputs in
//! reverse order so each backward call matches the most recent unmatched
//! forward call.

use crate::{
    config::TrainerConfig,
    error::{Result, TensorustError},
    nn::{init::cast, Layer, Loss, Optimizer, Parameter},
    tensor::{Scalar, Tensor},
};
use std::{marker::PhantomData, slice};

/// Drives forward, loss, backward and optimizer steps for one model.
#[derive(Debug)]
pub struct IncrementalTrainer<T, M, O, L> {
    model: M,
    optimizer: O,
    loss: L,
    config: TrainerConfig,
    _marker: PhantomData<T>,
}

impl<T, M, O, L> IncrementalTrainer<T, M, O, L>
where
    T: Scalar,
    M: Layer<T>,
    O: Optimizer<T>,
    L: Loss<T>,
{
    pub fn new(model: M, optimizer: O, loss: L) -> Self {
        Self {
            model,
            optimizer,
            loss,
            config: TrainerConfig::default(),
            _marker: PhantomData,
        }
    }

    pub fn with_config(mut self, config: TrainerConfig) -> Result<Self> {
        config.validate()?;
        self.config = config;
        Ok(self)
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    pub fn optimizer_mut(&mut self) -> &mut O {
        &mut self.optimizer
    }

    pub fn into_model(self) -> M {
        self.model
    }

    /// Trains on one sequence and returns its loss.
    ///
    /// # Errors
    ///
    /// Rejects empty or unequal input/target lists before touching the
    /// model. If a later step fails the model may still hold unmatched
    /// forward calls; `reset_state` drops them.
    pub fn update_incremental(&mut self, inputs: &[Tensor<T>], targets: &[Tensor<T>]) -> Result<T> {
        if inputs.is_empty() {
            return Err(TensorustError::InvalidInput(
                "at least one input must be provided".to_string(),
            ));
        }
        if inputs.len() != targets.len() {
            return Err(TensorustError::InvalidInput(format!(
                "{} inputs but {} targets",
                inputs.len(),
                targets.len()
            )));
        }

        let mut outputs = Vec::with_capacity(inputs.len());
        for input in inputs {
            outputs.push(self.model.forward(input)?);
        }
        let loss = self.loss.evaluate(&mut outputs, targets)?;
        for output in outputs.iter().rev() {
            self.model.backward(output)?;
        }

        let mut params = self.model.parameters_mut();
        if let Some(max_norm) = self.config.grad_clip_norm {
            let norm = clip_grad_norm(&mut params, max_norm)?;
            log::trace!("gradient norm {norm:?} (clip at {max_norm})");
        }
        self.optimizer.step(&mut params)?;
        self.model.zero_grad();

        log::debug!("incremental update over {} steps, loss {loss:?}", inputs.len());
        Ok(loss)
    }

    /// Trains on a single step.
    pub fn update(&mut self, input: &Tensor<T>, target: &Tensor<T>) -> Result<T> {
        self.update_incremental(slice::from_ref(input), slice::from_ref(target))
    }

    /// Runs the model over `inputs` without recording anything for backward.
    pub fn predict(&mut self, inputs: &[Tensor<T>]) -> Result<Vec<Tensor<T>>> {
        if inputs.is_empty() {
            return Err(TensorustError::InvalidInput(
                "at least one input must be provided".to_string(),
            ));
        }
        inputs.iter().map(|x| self.model.predict(x)).collect()
    }
}

/// Rescales every gradient so their global L2 norm is at most `max_norm`.
///
/// Returns the norm before clipping.
pub fn clip_grad_norm<T: Scalar>(params: &mut [&mut Parameter<T>], max_norm: f64) -> Result<T> {
    let max_norm: T = cast(max_norm)?;
    let norm = params
        .iter()
        .flat_map(|p| p.grad().iter())
        .fold(T::zero(), |acc, &g| acc + g * g)
        .sqrt();
    if norm > max_norm {
        let scale = max_norm / norm;
        for p in params.iter_mut() {
            p.grad_mut().iter_mut().for_each(|g| *g = *g * scale);
        }
    }
    Ok(norm)
}
