//! Fully connected (Dense) layer implementation.

use crate::{
    autodiff::{DifferentiableOp, OpHandle, Producer},
    config::DenseConfig,
    error::{Result, TensorustError},
    nn::{init::rng_from_seed, Layer, Parameter},
    tensor::{Scalar, Tensor},
};
use uuid::Uuid;

/// Input recorded by a forward call for the matching backward.
#[derive(Debug)]
struct CachedInput<T> {
    data: Vec<T>,
    batch_count: usize,
    producer: Option<Producer<T>>,
}

/// A fully connected (dense) layer.
///
/// This layer implements the operation `output = weights @ input + bias`
/// per batch slot, with `weights` stored `[output_dim, input_dim]` row-major.
#[derive(Debug)]
pub struct DenseLayer<T> {
    id: Uuid,
    handle: Option<OpHandle<T>>,
    weights: Parameter<T>,
    bias: Option<Parameter<T>>,
    input_dim: usize,
    output_dim: usize,
    /// Inputs of unmatched forward calls, most recent last.
    inputs: Vec<CachedInput<T>>,
    /// Buffers of consumed inputs, reused by later forward calls.
    spare: Vec<Vec<T>>,
}

impl<T: Scalar> DenseLayer<T> {
    /// Creates a new dense layer with sampled weights and zero bias.
    pub fn new(config: &DenseConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = rng_from_seed(config.seed);
        let weights = config.init.sample(config.input_dim, config.output_dim, &mut rng)?;
        let bias = config
            .use_bias
            .then(|| vec![T::zero(); config.output_dim]);
        Self::from_weights(weights, bias, config.input_dim, config.output_dim)
    }

    /// Creates a dense layer from explicit weights (`[output_dim, input_dim]`
    /// row-major) and an optional bias of length `output_dim`.
    pub fn from_weights(
        weights: Vec<T>,
        bias: Option<Vec<T>>,
        input_dim: usize,
        output_dim: usize,
    ) -> Result<Self> {
        if input_dim == 0 || output_dim == 0 {
            return Err(TensorustError::InvalidConfig(format!(
                "dense dims must be positive, got {input_dim}x{output_dim}"
            )));
        }
        let weights = Parameter::new("weights", weights, vec![output_dim, input_dim])?;
        let bias = bias
            .map(|b| Parameter::new("bias", b, vec![output_dim]))
            .transpose()?;
        Ok(Self {
            id: Uuid::new_v4(),
            handle: None,
            weights,
            bias,
            input_dim,
            output_dim,
            inputs: Vec::new(),
            spare: Vec::new(),
        })
    }

    pub fn weights(&self) -> &Parameter<T> {
        &self.weights
    }

    pub fn weights_mut(&mut self) -> &mut Parameter<T> {
        &mut self.weights
    }

    pub fn bias(&self) -> Option<&Parameter<T>> {
        self.bias.as_ref()
    }

    pub fn bias_mut(&mut self) -> Option<&mut Parameter<T>> {
        self.bias.as_mut()
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn output_dim(&self) -> usize {
        self.output_dim
    }

    pub fn use_bias(&self) -> bool {
        self.bias.is_some()
    }

    /// Number of forward calls not yet matched by backward.
    pub fn pending_depth(&self) -> usize {
        self.inputs.len()
    }

    /// Drops every recorded input.
    pub fn clear_cache(&mut self) {
        for cached in self.inputs.drain(..) {
            self.spare.push(cached.data);
        }
    }

    fn check_input(&self, input: &[T], batch_count: usize) -> Result<()> {
        if batch_count == 0 {
            return Err(TensorustError::InvalidInput(
                "dense input has no samples".to_string(),
            ));
        }
        if input.len() != self.input_dim * batch_count {
            return Err(TensorustError::length_mismatch(
                self.input_dim * batch_count,
                input.len(),
            ));
        }
        Ok(())
    }

    /// Adds `weights @ input + bias` for every batch slot into `out`.
    fn affine_into(&self, input: &[T], batch_count: usize, out: &mut [T]) {
        let w = self.weights.data();
        for b in 0..batch_count {
            let x = &input[b * self.input_dim..(b + 1) * self.input_dim];
            let y = &mut out[b * self.output_dim..(b + 1) * self.output_dim];
            for (o, y_o) in y.iter_mut().enumerate() {
                let row = &w[o * self.input_dim..(o + 1) * self.input_dim];
                let mut acc = row.iter().zip(x).fold(T::zero(), |acc, (&w, &x)| acc + w * x);
                if let Some(bias) = &self.bias {
                    acc = acc + bias.data()[o];
                }
                *y_o = *y_o + acc;
            }
        }
    }

    /// Adds `weights @ input + bias` into `out` without recording anything.
    pub fn predict_accumulate(&self, input: &[T], batch_count: usize, out: &mut [T]) -> Result<()> {
        self.check_input(input, batch_count)?;
        self.check_output(out, batch_count)?;
        self.affine_into(input, batch_count, out);
        Ok(())
    }

    fn check_output(&self, out: &[T], batch_count: usize) -> Result<()> {
        if out.len() != self.output_dim * batch_count {
            return Err(TensorustError::length_mismatch(
                self.output_dim * batch_count,
                out.len(),
            ));
        }
        Ok(())
    }

    /// Forward pass that adds its result into `out` (length
    /// `output_dim * batch_count`) and records the input for backward.
    pub fn forward_accumulate(
        &mut self,
        input: &[T],
        batch_count: usize,
        producer: Option<Producer<T>>,
        out: &mut [T],
    ) -> Result<()> {
        self.check_input(input, batch_count)?;
        self.check_output(out, batch_count)?;
        self.affine_into(input, batch_count, out);

        let mut data = self.spare.pop().unwrap_or_default();
        data.clear();
        data.extend_from_slice(input);
        self.inputs.push(CachedInput {
            data,
            batch_count,
            producer,
        });
        Ok(())
    }

    /// Backward pass from a raw output gradient.
    ///
    /// Pops the most recent recorded input, accumulates weight and bias
    /// gradients and returns the gradient with respect to that input.
    pub fn backward_gradient(&mut self, grad_output: &[T]) -> Result<Vec<T>> {
        let cached = self.pop_input(grad_output)?;
        let grad_input = self.accumulate_grads(&cached, grad_output);
        self.spare.push(cached.data);
        Ok(grad_input)
    }

    /// Backward pass that hands back the consumed input as a tensor carrying
    /// its gradient and the producer it came from.
    pub fn backward_input(&mut self, grad_output: &[T]) -> Result<Tensor<T>> {
        let cached = self.pop_input(grad_output)?;
        let grad_input = self.accumulate_grads(&cached, grad_output);
        let CachedInput {
            data,
            batch_count,
            producer,
        } = cached;
        let input = Tensor::new(data, vec![self.input_dim], batch_count)?.with_grad(grad_input)?;
        Ok(match producer {
            Some(producer) => input.with_producer(producer),
            None => input,
        })
    }

    /// Returns a consumed input buffer for reuse.
    pub(crate) fn recycle(&mut self, data: Vec<T>) {
        self.spare.push(data);
    }

    #[cfg(test)]
    pub(crate) fn spare_buffers(&self) -> usize {
        self.spare.len()
    }

    fn pop_input(&mut self, grad_output: &[T]) -> Result<CachedInput<T>> {
        let cached = self.inputs.last().ok_or_else(|| TensorustError::NoPendingForward {
            layer: "DenseLayer".to_string(),
        })?;
        let expected = self.output_dim * cached.batch_count;
        if grad_output.len() != expected {
            return Err(TensorustError::length_mismatch(expected, grad_output.len()));
        }
        self.inputs.pop().ok_or_else(|| TensorustError::NoPendingForward {
            layer: "DenseLayer".to_string(),
        })
    }

    fn accumulate_grads(&mut self, cached: &CachedInput<T>, grad_output: &[T]) -> Vec<T> {
        let (in_dim, out_dim) = (self.input_dim, self.output_dim);
        let mut grad_input = vec![T::zero(); in_dim * cached.batch_count];
        for b in 0..cached.batch_count {
            let x = &cached.data[b * in_dim..(b + 1) * in_dim];
            let gy = &grad_output[b * out_dim..(b + 1) * out_dim];
            let gx = &mut grad_input[b * in_dim..(b + 1) * in_dim];
            for (o, &g) in gy.iter().enumerate() {
                if g == T::zero() {
                    continue;
                }
                let row = o * in_dim..(o + 1) * in_dim;
                let w_row = &self.weights.data()[row.clone()];
                for (gx_k, &w) in gx.iter_mut().zip(w_row) {
                    *gx_k = *gx_k + g * w;
                }
                let gw_row = &mut self.weights.grad_mut()[row];
                for (gw, &x_k) in gw_row.iter_mut().zip(x) {
                    *gw = *gw + g * x_k;
                }
                if let Some(bias) = &mut self.bias {
                    let gb = &mut bias.grad_mut()[o];
                    *gb = *gb + g;
                }
            }
        }
        grad_input
    }

    fn producer(&self) -> Producer<T> {
        Producer::new(self.id, self.handle.clone())
    }
}

impl<T: Scalar> Layer<T> for DenseLayer<T> {
    fn forward(&mut self, input: &Tensor<T>) -> Result<Tensor<T>> {
        let mut out = vec![T::zero(); self.output_dim * input.batch_count()];
        self.forward_accumulate(
            input.data(),
            input.batch_count(),
            input.producer().cloned(),
            &mut out,
        )?;
        Ok(Tensor::new(out, vec![self.output_dim], input.batch_count())?.with_producer(self.producer()))
    }

    fn backward(&mut self, output: &Tensor<T>) -> Result<Vec<T>> {
        let grad = output.grad().ok_or(TensorustError::MissingGradient)?;
        self.backward_gradient(grad)
    }

    fn predict(&mut self, input: &Tensor<T>) -> Result<Tensor<T>> {
        let mut out = vec![T::zero(); self.output_dim * input.batch_count()];
        self.predict_accumulate(input.data(), input.batch_count(), &mut out)?;
        Ok(Tensor::new(out, vec![self.output_dim], input.batch_count())?.with_producer(self.producer()))
    }

    fn reset_state(&mut self) {
        self.clear_cache();
    }

    fn parameters(&self) -> Vec<&Parameter<T>> {
        let mut params = vec![&self.weights];
        params.extend(self.bias.as_ref());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter<T>> {
        let mut params = vec![&mut self.weights];
        params.extend(self.bias.as_mut());
        params
    }
}

impl<T: Scalar> DifferentiableOp<T> for DenseLayer<T> {
    fn op_id(&self) -> Uuid {
        self.id
    }

    /// Runs the local backward, then continues into the producer of the
    /// matching input when there is one.
    fn backward(&mut self, output: &Tensor<T>) -> Result<()> {
        let grad = output.grad().ok_or(TensorustError::MissingGradient)?;
        let input = self.backward_input(grad)?;
        let upstream = input.producer().filter(|p| p.id() != self.id).cloned();
        match upstream {
            Some(producer) => {
                producer.dispatch(&input)?;
            }
            None => self.recycle(input.into_data()),
        }
        Ok(())
    }

    fn attach(&mut self, handle: OpHandle<T>) {
        self.handle = Some(handle);
    }
}
