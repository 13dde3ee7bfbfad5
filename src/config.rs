//! Configuration types.
//!
//! - [`LstmConfig`]: recurrent layer sizes and initialization
//! - [`DenseConfig`]: affine layer sizes and initialization
//! - [`TrainerConfig`]: incremental trainer options

use crate::{
    error::{Result, TensorustError},
    nn::WeightInit,
};
use serde::{Deserialize, Serialize};

/// Configuration for an [`Lstm`](crate::nn::Lstm) layer.
///
/// # Example
///
/// ```
/// use tensorust_recurrent::config::LstmConfig;
///
/// let config = LstmConfig::new(3, 8).with_forget_bias(1.0).with_seed(7);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LstmConfig {
    /// Values per input sample.
    pub input_size: usize,
    /// Hidden units; the hidden and cell states hold this many values per sample.
    pub output_size: usize,
    /// Initialization of the upward and lateral weight matrices.
    pub init: WeightInit,
    /// Initial bias of the candidate, input and output gates.
    pub bias: f64,
    /// Initial bias of the forget gate.
    pub forget_bias: f64,
    /// Seed for weight sampling.
    pub seed: Option<u64>,
}

impl Default for LstmConfig {
    fn default() -> Self {
        Self {
            input_size: 1,
            output_size: 1,
            init: WeightInit::XavierUniform,
            bias: 0.0,
            forget_bias: 0.0,
            seed: None,
        }
    }
}

impl LstmConfig {
    pub fn new(input_size: usize, output_size: usize) -> Self {
        Self {
            input_size,
            output_size,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_init(mut self, init: WeightInit) -> Self {
        self.init = init;
        self
    }

    #[must_use]
    pub const fn with_bias(mut self, bias: f64) -> Self {
        self.bias = bias;
        self
    }

    #[must_use]
    pub const fn with_forget_bias(mut self, forget_bias: f64) -> Self {
        self.forget_bias = forget_bias;
        self
    }

    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_size == 0 || self.output_size == 0 {
            return Err(TensorustError::InvalidConfig(format!(
                "lstm sizes must be positive, got input {} output {}",
                self.input_size, self.output_size
            )));
        }
        if !self.bias.is_finite() || !self.forget_bias.is_finite() {
            return Err(TensorustError::InvalidConfig(
                "lstm biases must be finite".to_string(),
            ));
        }
        self.init.validate()
    }
}

/// Configuration for a [`DenseLayer`](crate::nn::DenseLayer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DenseConfig {
    pub input_dim: usize,
    pub output_dim: usize,
    pub use_bias: bool,
    pub init: WeightInit,
    pub seed: Option<u64>,
}

impl Default for DenseConfig {
    fn default() -> Self {
        Self {
            input_dim: 1,
            output_dim: 1,
            use_bias: true,
            init: WeightInit::XavierUniform,
            seed: None,
        }
    }
}

impl DenseConfig {
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_bias(mut self, use_bias: bool) -> Self {
        self.use_bias = use_bias;
        self
    }

    #[must_use]
    pub const fn with_init(mut self, init: WeightInit) -> Self {
        self.init = init;
        self
    }

    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_dim == 0 || self.output_dim == 0 {
            return Err(TensorustError::InvalidConfig(format!(
                "dense dims must be positive, got {}x{}",
                self.input_dim, self.output_dim
            )));
        }
        self.init.validate()
    }
}

/// Options for the [`IncrementalTrainer`](crate::nn::IncrementalTrainer).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// Rescale all gradients so their global L2 norm does not exceed this.
    pub grad_clip_norm: Option<f64>,
}

impl TrainerConfig {
    #[must_use]
    pub const fn with_grad_clip(mut self, max_norm: f64) -> Self {
        self.grad_clip_norm = Some(max_norm);
        self
    }

    pub fn validate(&self) -> Result<()> {
        match self.grad_clip_norm {
            Some(n) if !(n.is_finite() && n > 0.0) => Err(TensorustError::InvalidConfig(format!(
                "grad clip norm must be positive, got {n}"
            ))),
            _ => Ok(()),
        }
    }
}
