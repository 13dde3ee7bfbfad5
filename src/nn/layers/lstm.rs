//! Long Short-Term Memory (LSTM) layer implementation.
//!
//! The layer keeps its hidden and cell state between calls, so a sequence is
//! fed one step at a time. Every `forward` records a step cache; every
//! `backward` consumes the most recent one, giving truncated
//! backpropagation through time over however many steps are pending.
//!
//! Gate pre-activations come from two affine transforms summed into one
//! buffer: `upward` (input to `4 * output_size`, with bias) and `lateral`
//! (previous hidden state to `4 * output_size`, no bias). The buffer is
//! interleaved per unit as `[a, i, f, o]`:
//!
//! - candidate: `a = tanh(.)`
//! - input gate: `i = sigmoid(.)`
//! - forget gate: `f = sigmoid(.)`
//! - output gate: `o = sigmoid(.)`
//! - cell state: `c = a * i + f * c_prev`
//! - hidden state: `h = o * tanh(c)`

mod cache;
mod state;

pub use state::{CellAdaptation, HiddenAdaptation};

use self::{
    cache::{CachePool, LateralSource},
    state::{adapt_cell, adapt_hidden, fold_cell_grad, fold_hidden_grad},
};
use crate::{
    autodiff::{self, DifferentiableOp, OpHandle, Producer},
    config::LstmConfig,
    error::{Result, TensorustError},
    nn::{
        activations::{sigmoid, sigmoid_grad, tanh, tanh_grad},
        init::{cast, rng_from_seed},
        DenseLayer, Layer, Parameter,
    },
    tensor::{Scalar, Tensor},
};
use std::{cell::RefCell, rc::Rc};
use uuid::Uuid;

const GATES: usize = 4;

/// Gradients that reached the state the current window started from.
///
/// Filled by backward calls and reset when a new window opens, i.e. on the
/// first forward call after every pending step was consumed.
#[derive(Debug, Clone, PartialEq)]
pub struct StateGradients<T> {
    hidden: Option<Vec<T>>,
    cell: Option<Vec<T>>,
}

impl<T> Default for StateGradients<T> {
    fn default() -> Self {
        Self {
            hidden: None,
            cell: None,
        }
    }
}

impl<T> StateGradients<T> {
    /// Gradient with respect to the hidden state that was not produced by a
    /// forward step of this window.
    pub fn hidden(&self) -> Option<&[T]> {
        self.hidden.as_deref()
    }

    /// Gradient with respect to the cell state the window started from.
    pub fn cell(&self) -> Option<&[T]> {
        self.cell.as_deref()
    }
}

/// State gradients waiting for the backward call of the step that produced
/// the state, keyed by that step's serial.
#[derive(Debug)]
struct GradientCarry<T> {
    entries: Vec<(u64, Vec<T>)>,
}

impl<T: Scalar> GradientCarry<T> {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    fn add(&mut self, target: u64, grad: Vec<T>) {
        match self
            .entries
            .iter_mut()
            .find(|(t, g)| *t == target && g.len() == grad.len())
        {
            Some((_, acc)) => add_assign(acc, &grad),
            None => self.entries.push((target, grad)),
        }
    }

    fn take(&mut self, target: u64, len: usize) -> Option<Vec<T>> {
        let pos = self
            .entries
            .iter()
            .rposition(|(t, g)| *t == target && g.len() == len)?;
        Some(self.entries.swap_remove(pos).1)
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

fn add_assign<T: Scalar>(acc: &mut [T], grad: &[T]) {
    for (a, &g) in acc.iter_mut().zip(grad) {
        *a = *a + g;
    }
}

fn accumulate_into<T: Scalar>(slot: &mut Option<Vec<T>>, grad: Vec<T>, what: &str) {
    if let Some(acc) = slot.as_mut().filter(|acc| acc.len() == grad.len()) {
        add_assign(acc, &grad);
        return;
    }
    if let Some(previous) = slot.as_ref() {
        log::warn!(
            "dropping {what} boundary gradient of length {} for one of length {}",
            previous.len(),
            grad.len()
        );
    }
    *slot = Some(grad);
}

/// An LSTM layer with persistent state and truncated BPTT.
///
/// # Example
///
/// ```
/// use tensorust_recurrent::{config::LstmConfig, nn::{Layer, Lstm}, Tensor};
///
/// let mut lstm = Lstm::<f32>::new(&LstmConfig::new(3, 4).with_seed(1)).unwrap();
/// let x = Tensor::from_slice(&[0.1, 0.2, 0.3]);
/// let mut h = lstm.forward(&x).unwrap();
/// assert_eq!(h.len(), 4);
///
/// h.set_grad(vec![1.0; 4]).unwrap();
/// let dx = lstm.backward(&h).unwrap();
/// assert_eq!(dx.len(), 3);
/// assert_eq!(lstm.pending_depth(), 0);
/// ```
#[derive(Debug)]
pub struct Lstm<T> {
    id: Uuid,
    handle: Option<OpHandle<T>>,
    upward: DenseLayer<T>,
    lateral: DenseLayer<T>,
    input_size: usize,
    output_size: usize,

    hidden_state: Option<Tensor<T>>,
    /// Serial of the forward step that produced `hidden_state`.
    hidden_origin: Option<u64>,
    /// Batch-major; empty when there is no cell state.
    cell_state: Vec<T>,
    cell_origin: Option<u64>,

    caches: CachePool<T>,
    next_serial: u64,
    hidden_carry: GradientCarry<T>,
    cell_carry: GradientCarry<T>,
    boundary: StateGradients<T>,

    // scratch
    gates: Vec<T>,
    gate_grad: Vec<T>,
    adapted_hidden: Vec<T>,
}

impl<T: Scalar> Lstm<T> {
    /// Creates a layer with sampled weights.
    ///
    /// The candidate, input and output gate biases start at `config.bias`,
    /// the forget gate bias at `config.forget_bias`.
    pub fn new(config: &LstmConfig) -> Result<Self> {
        config.validate()?;
        let (n, m) = (config.input_size, config.output_size);
        let mut rng = rng_from_seed(config.seed);
        let upward = config.init.sample(n, GATES * m, &mut rng)?;
        let lateral = config.init.sample(m, GATES * m, &mut rng)?;
        Self::from_weights(n, m, upward, lateral, Some(gate_bias(config)?))
    }

    /// Creates a layer from full gate matrices.
    ///
    /// `upward` is `[4 * output_size, input_size]` and `lateral` is
    /// `[4 * output_size, output_size]`, both row-major with rows interleaved
    /// per unit as `[a, i, f, o]`. `bias` has `4 * output_size` values.
    pub fn from_weights(
        input_size: usize,
        output_size: usize,
        upward: Vec<T>,
        lateral: Vec<T>,
        bias: Option<Vec<T>>,
    ) -> Result<Self> {
        if input_size == 0 || output_size == 0 {
            return Err(TensorustError::InvalidConfig(format!(
                "lstm sizes must be positive, got input {input_size} output {output_size}"
            )));
        }
        let upward = DenseLayer::from_weights(upward, bias, input_size, GATES * output_size)?;
        let lateral = DenseLayer::from_weights(lateral, None, output_size, GATES * output_size)?;
        Ok(Self {
            id: Uuid::new_v4(),
            handle: None,
            upward,
            lateral,
            input_size,
            output_size,
            hidden_state: None,
            hidden_origin: None,
            cell_state: Vec::new(),
            cell_origin: None,
            caches: CachePool::new(),
            next_serial: 0,
            hidden_carry: GradientCarry::new(),
            cell_carry: GradientCarry::new(),
            boundary: StateGradients::default(),
            gates: Vec::new(),
            gate_grad: Vec::new(),
            adapted_hidden: Vec::new(),
        })
    }

    /// Creates a layer whose four gates share one initial matrix each.
    ///
    /// `upward` is `[output_size, input_size]` and `lateral` is
    /// `[output_size, output_size]`; row `j` is copied to every gate of unit
    /// `j`. Biases come from `config`.
    pub fn from_gate_weights(config: &LstmConfig, upward: &[T], lateral: &[T]) -> Result<Self> {
        config.validate()?;
        let (n, m) = (config.input_size, config.output_size);
        if upward.len() != m * n {
            return Err(TensorustError::ShapeMismatch {
                expected: vec![m, n],
                actual: vec![upward.len()],
            });
        }
        if lateral.len() != m * m {
            return Err(TensorustError::ShapeMismatch {
                expected: vec![m, m],
                actual: vec![lateral.len()],
            });
        }
        let upward = replicate_rows(upward, n, m);
        let lateral = replicate_rows(lateral, m, m);
        Self::from_weights(n, m, upward, lateral, Some(gate_bias(config)?))
    }

    /// Wraps the layer so tensors it produces can dispatch backward into it.
    pub fn into_shared(self) -> Rc<RefCell<Self>> {
        autodiff::shared(self)
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn output_size(&self) -> usize {
        self.output_size
    }

    /// Input-to-gates transform.
    pub fn upward(&self) -> &DenseLayer<T> {
        &self.upward
    }

    pub fn upward_mut(&mut self) -> &mut DenseLayer<T> {
        &mut self.upward
    }

    /// Hidden-to-gates transform.
    pub fn lateral(&self) -> &DenseLayer<T> {
        &self.lateral
    }

    pub fn lateral_mut(&mut self) -> &mut DenseLayer<T> {
        &mut self.lateral
    }

    /// Forward steps not yet matched by backward.
    pub fn pending_depth(&self) -> usize {
        self.caches.depth()
    }

    /// Step caches allocated so far, pending or reusable.
    pub fn cache_capacity(&self) -> usize {
        self.caches.capacity()
    }

    pub fn state_gradients(&self) -> &StateGradients<T> {
        &self.boundary
    }

    /// Copy of the current hidden state.
    pub fn hidden_state(&self) -> Option<Tensor<T>> {
        self.hidden_state.clone()
    }

    /// Copy of the current cell state, shaped `[output_size]` per sample.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if the stored buffer is not a whole number of
    /// samples.
    pub fn cell_state(&self) -> Result<Option<Tensor<T>>> {
        if self.cell_state.is_empty() {
            return Ok(None);
        }
        let batch_count = (self.cell_state.len() / self.output_size).max(1);
        let tensor = Tensor::new(self.cell_state.clone(), vec![self.output_size], batch_count)?;
        Ok(Some(tensor.with_producer(self.producer())))
    }

    /// Replaces the hidden state and drops every pending step.
    ///
    /// A tensor keeps its producer, so a later backward reaching this state
    /// continues into whatever created it.
    ///
    /// # Errors
    ///
    /// Returns [`TensorustError::StateLengthMismatch`] if the sample length is
    /// not `output_size`; the layer is left untouched.
    pub fn set_hidden_state(&mut self, state: Option<Tensor<T>>) -> Result<()> {
        let state = state.map(|t| self.normalize_state(t)).transpose()?;
        self.clear_window();
        self.hidden_state = state;
        self.hidden_origin = None;
        Ok(())
    }

    /// Replaces the cell state and drops every pending step.
    ///
    /// # Errors
    ///
    /// Returns [`TensorustError::StateLengthMismatch`] if the sample length is
    /// not `output_size`; the layer is left untouched.
    pub fn set_cell_state(&mut self, state: Option<Tensor<T>>) -> Result<()> {
        let state = state.map(|t| self.normalize_state(t)).transpose()?;
        self.clear_window();
        self.cell_state = state.map(Tensor::into_data).unwrap_or_default();
        self.cell_origin = None;
        Ok(())
    }

    /// Clears hidden state, cell state and every pending step.
    pub fn reset_states(&mut self) {
        self.reset();
    }

    fn reset(&mut self) {
        self.clear_window();
        self.hidden_state = None;
        self.hidden_origin = None;
        self.cell_state.clear();
        self.cell_origin = None;
        self.boundary = StateGradients::default();
        log::debug!("lstm {} state reset", self.id);
    }

    fn clear_window(&mut self) {
        if self.caches.depth() > 0 {
            log::debug!(
                "lstm {} dropping {} pending steps",
                self.id,
                self.caches.depth()
            );
        }
        self.caches.clear();
        self.upward.clear_cache();
        self.lateral.clear_cache();
        self.hidden_carry.clear();
        self.cell_carry.clear();
    }

    fn normalize_state(&self, state: Tensor<T>) -> Result<Tensor<T>> {
        if state.sample_len() != self.output_size {
            return Err(TensorustError::StateLengthMismatch {
                expected: self.output_size,
                actual: state.sample_len(),
            });
        }
        let producer = state.producer().cloned();
        let batch_count = state.batch_count();
        let normalized = Tensor::new(state.into_data(), vec![self.output_size], batch_count)?;
        Ok(match producer {
            Some(producer) => normalized.with_producer(producer),
            None => normalized,
        })
    }

    fn check_input(&self, input: &Tensor<T>) -> Result<()> {
        if input.sample_len() != self.input_size {
            return Err(TensorustError::ShapeMismatch {
                expected: vec![self.input_size],
                actual: input.shape().to_vec(),
            });
        }
        Ok(())
    }

    /// Adapts the hidden state to `batch_count` into the scratch buffer.
    fn prepare_hidden(&mut self, batch_count: usize) -> Result<Option<HiddenAdaptation>> {
        self.hidden_state
            .as_ref()
            .map(|h| {
                adapt_hidden(
                    h.data(),
                    self.output_size,
                    h.batch_count(),
                    batch_count,
                    &mut self.adapted_hidden,
                )
            })
            .transpose()
    }

    fn producer(&self) -> Producer<T> {
        Producer::new(self.id, self.handle.clone())
    }

    fn set_hidden_output(&mut self, hidden: Vec<T>, batch_count: usize, origin: Option<u64>) -> Result<Tensor<T>> {
        let output = Tensor::new(hidden, vec![self.output_size], batch_count)?.with_producer(self.producer());
        self.hidden_state = Some(output.clone());
        self.hidden_origin = origin;
        Ok(output)
    }

    fn step(&mut self, input: &Tensor<T>) -> Result<Tensor<T>> {
        self.check_input(input)?;
        let batch_count = input.batch_count();
        let len = self.output_size * batch_count;
        let hidden_adaptation = self.prepare_hidden(batch_count)?;

        if self.caches.depth() == 0 {
            self.boundary = StateGradients::default();
            self.hidden_carry.clear();
            self.cell_carry.clear();
        }

        self.gates.clear();
        self.gates.resize(GATES * len, T::zero());
        self.upward.forward_accumulate(
            input.data(),
            batch_count,
            input.producer().cloned(),
            &mut self.gates,
        )?;
        if hidden_adaptation.is_some() {
            self.lateral
                .forward_accumulate(&self.adapted_hidden, batch_count, None, &mut self.gates)?;
        }
        let cell_adaptation = adapt_cell(&mut self.cell_state, self.output_size, batch_count);

        let serial = self.next_serial;
        self.next_serial += 1;

        let record = self.caches.acquire(len);
        record.serial = serial;
        record.batch_count = batch_count;
        record.cell_adaptation = cell_adaptation;
        record.cell_origin = self.cell_origin;
        if let (Some(adaptation), Some(h)) = (hidden_adaptation, &self.hidden_state) {
            record.h_prev.extend_from_slice(h.data());
            record.lateral = Some(LateralSource {
                batch_count: h.batch_count(),
                producer: h.producer().cloned(),
                adaptation,
                origin: self.hidden_origin,
            });
        }
        record.c_prev.copy_from_slice(&self.cell_state);

        let mut hidden = vec![T::zero(); len];
        for (j, (h, gates)) in hidden.iter_mut().zip(self.gates.chunks(GATES)).enumerate() {
            let a = tanh(gates[0]);
            let i = sigmoid(gates[1]);
            let f = sigmoid(gates[2]);
            let o = sigmoid(gates[3]);
            let c = a * i + f * record.c_prev[j];
            record.a[j] = a;
            record.i[j] = i;
            record.f[j] = f;
            record.o[j] = o;
            record.c[j] = c;
            *h = o * tanh(c);
        }
        self.cell_state.copy_from_slice(&record.c);
        self.cell_origin = Some(serial);

        log::trace!(
            "lstm {} forward step {serial}, batch {batch_count}, pending {}",
            self.id,
            self.caches.depth()
        );
        self.set_hidden_output(hidden, batch_count, Some(serial))
    }

    /// Consumes the most recent pending step.
    ///
    /// Returns the step's input carrying its gradient and producer.
    fn step_backward(&mut self, grad: &[T]) -> Result<Tensor<T>> {
        let record = self.caches.last().ok_or_else(|| TensorustError::NoPendingForward {
            layer: "Lstm".to_string(),
        })?;
        let len = self.output_size * record.batch_count;
        if grad.len() != len {
            return Err(TensorustError::length_mismatch(len, grad.len()));
        }
        let serial = record.serial;

        let mut dh = grad.to_vec();
        if let Some(carried) = self.hidden_carry.take(serial, len) {
            add_assign(&mut dh, &carried);
        }
        let dc = self
            .cell_carry
            .take(serial, len)
            .unwrap_or_else(|| vec![T::zero(); len]);

        let record = self.caches.consume().ok_or_else(|| TensorustError::NoPendingForward {
            layer: "Lstm".to_string(),
        })?;
        self.gate_grad.clear();
        self.gate_grad.resize(GATES * len, T::zero());
        let mut dc_prev = vec![T::zero(); len];
        for (j, g) in self.gate_grad.chunks_mut(GATES).enumerate() {
            let (a, i, f, o) = (record.a[j], record.i[j], record.f[j], record.o[j]);
            let co = tanh(record.c[j]);
            let gc = dh[j] * o * tanh_grad(co) + dc[j];
            g[0] = gc * i * tanh_grad(a);
            g[1] = gc * a * sigmoid_grad(i);
            g[2] = gc * record.c_prev[j] * sigmoid_grad(f);
            g[3] = dh[j] * co * sigmoid_grad(o);
            dc_prev[j] = gc * f;
        }
        let lateral = record
            .lateral
            .clone()
            .map(|source| (source, record.h_prev.clone()));
        let (cell_adaptation, cell_origin) = (record.cell_adaptation, record.cell_origin);

        if let Some((source, h_prev)) = lateral {
            let dh_adapted = self.lateral.backward_gradient(&self.gate_grad)?;
            let mut dh_prev = Vec::with_capacity(h_prev.len());
            fold_hidden_grad(&dh_adapted, self.output_size, source.adaptation, &mut dh_prev);
            match source.origin {
                Some(origin) => self.hidden_carry.add(origin, dh_prev),
                None => {
                    if let Some(producer) = source.producer.filter(|p| p.id() != self.id) {
                        let upstream = Tensor::new(h_prev, vec![self.output_size], source.batch_count)?
                            .with_grad(dh_prev.clone())?
                            .with_producer(producer.clone());
                        producer.dispatch(&upstream)?;
                    }
                    accumulate_into(&mut self.boundary.hidden, dh_prev, "hidden");
                }
            }
        }

        let mut dc_src = Vec::with_capacity(len);
        fold_cell_grad(&dc_prev, cell_adaptation, &mut dc_src);
        match cell_origin {
            Some(origin) => self.cell_carry.add(origin, dc_src),
            None => accumulate_into(&mut self.boundary.cell, dc_src, "cell"),
        }

        let input = self.upward.backward_input(&self.gate_grad)?;

        if self.caches.depth() == 0 {
            // whatever is still carried targets steps outside this window
            for (_, g) in self.hidden_carry.entries.drain(..) {
                accumulate_into(&mut self.boundary.hidden, g, "hidden");
            }
            for (_, g) in self.cell_carry.entries.drain(..) {
                accumulate_into(&mut self.boundary.cell, g, "cell");
            }
        }
        log::trace!(
            "lstm {} backward step {serial}, pending {}",
            self.id,
            self.caches.depth()
        );
        Ok(input)
    }

    fn step_without_cache(&mut self, input: &Tensor<T>) -> Result<Tensor<T>> {
        self.check_input(input)?;
        let batch_count = input.batch_count();
        let len = self.output_size * batch_count;
        let hidden_adaptation = self.prepare_hidden(batch_count)?;

        self.gates.clear();
        self.gates.resize(GATES * len, T::zero());
        self.upward
            .predict_accumulate(input.data(), batch_count, &mut self.gates)?;
        if hidden_adaptation.is_some() {
            self.lateral
                .predict_accumulate(&self.adapted_hidden, batch_count, &mut self.gates)?;
        }
        adapt_cell(&mut self.cell_state, self.output_size, batch_count);

        let mut hidden = vec![T::zero(); len];
        for ((h, c), gates) in hidden
            .iter_mut()
            .zip(self.cell_state.iter_mut())
            .zip(self.gates.chunks(GATES))
        {
            let a = tanh(gates[0]);
            let i = sigmoid(gates[1]);
            let f = sigmoid(gates[2]);
            let o = sigmoid(gates[3]);
            *c = a * i + f * *c;
            *h = o * tanh(*c);
        }
        self.cell_origin = None;
        self.set_hidden_output(hidden, batch_count, None)
    }
}

/// Bias vector with the forget gate slot of every unit set apart.
fn gate_bias<T: Scalar>(config: &LstmConfig) -> Result<Vec<T>> {
    (0..GATES * config.output_size)
        .map(|r| cast(if r % GATES == 2 { config.forget_bias } else { config.bias }))
        .collect()
}

/// Expands `[rows, cols]` to `[GATES * rows, cols]`, giving every gate of
/// unit `j` a copy of row `j`.
fn replicate_rows<T: Scalar>(matrix: &[T], cols: usize, rows: usize) -> Vec<T> {
    (0..GATES * rows)
        .flat_map(|r| {
            let j = r / GATES;
            matrix[j * cols..(j + 1) * cols].iter().copied()
        })
        .collect()
}

impl<T: Scalar> Layer<T> for Lstm<T> {
    fn forward(&mut self, input: &Tensor<T>) -> Result<Tensor<T>> {
        self.step(input)
    }

    fn backward(&mut self, output: &Tensor<T>) -> Result<Vec<T>> {
        let grad = output.grad().ok_or(TensorustError::MissingGradient)?;
        let input = self.step_backward(grad)?;
        let grad_input = input
            .grad()
            .map(<[T]>::to_vec)
            .ok_or(TensorustError::MissingGradient)?;
        self.upward.recycle(input.into_data());
        Ok(grad_input)
    }

    fn predict(&mut self, input: &Tensor<T>) -> Result<Tensor<T>> {
        self.step_without_cache(input)
    }

    fn reset_state(&mut self) {
        self.reset();
    }

    fn parameters(&self) -> Vec<&Parameter<T>> {
        let mut params = self.upward.parameters();
        params.extend(self.lateral.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter<T>> {
        let mut params = self.upward.parameters_mut();
        params.extend(self.lateral.parameters_mut());
        params
    }
}

impl<T: Scalar> DifferentiableOp<T> for Lstm<T> {
    fn op_id(&self) -> Uuid {
        self.id
    }

    /// Runs one backward step, then continues into the producer of that
    /// step's input when there is one.
    fn backward(&mut self, output: &Tensor<T>) -> Result<()> {
        let grad = output.grad().ok_or(TensorustError::MissingGradient)?;
        let input = self.step_backward(grad)?;
        let upstream = input.producer().filter(|p| p.id() != self.id).cloned();
        match upstream {
            Some(producer) => {
                producer.dispatch(&input)?;
            }
            None => self.upward.recycle(input.into_data()),
        }
        Ok(())
    }

    fn attach(&mut self, handle: OpHandle<T>) {
        self.handle = Some(handle);
    }
}
