use thiserror::Error;

#[derive(Error, Debug)]
pub enum TensorustError {
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("State length mismatch: expected {expected} values per sample, got {actual}")]
    StateLengthMismatch { expected: usize, actual: usize },
    #[error("Cannot adapt hidden state from batch count {previous} to {requested}")]
    BatchMismatch { previous: usize, requested: usize },
    #[error("Tensor has no gradient buffer")]
    MissingGradient,
    #[error("Backward called on {layer} with no pending forward call")]
    NoPendingForward { layer: String },
    #[error("Producer is already borrowed; cannot dispatch backward")]
    ProducerBusy,
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl TensorustError {
    pub(crate) fn length_mismatch(expected: usize, actual: usize) -> Self {
        TensorustError::ShapeMismatch {
            expected: vec![expected],
            actual: vec![actual],
        }
    }
}

pub type Result<T> = std::result::Result<T, TensorustError>;
