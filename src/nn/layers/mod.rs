//! Neural network layers.
//!
//! Every layer implements [`Layer`](crate::nn::Layer) for explicit
//! forward/backward pairing and
//! [`DifferentiableOp`](crate::autodiff::DifferentiableOp) so tensors it
//! produces can dispatch gradients back into it.

pub mod dense;
pub mod lstm;

pub use dense::DenseLayer;
pub use lstm::{CellAdaptation, HiddenAdaptation, Lstm, StateGradients};
