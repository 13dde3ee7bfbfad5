//! Recurrent layers with truncated backpropagation through time.
//!
//! The centerpiece is [`nn::Lstm`], a stateful LSTM layer fed one sequence
//! step per call. Tensors carry a weak back-reference to the operation that
//! produced them (see [`autodiff`]), so gradients can cross layer boundaries
//! without a global graph.

pub mod autodiff;
pub mod config;
pub mod error;
pub mod nn;
pub mod tensor;

pub use error::{Result, TensorustError};
pub use tensor::{Scalar, Tensor};
