//! Error types for the normalization layers

use thiserror::Error;

/// Result type for layer construction and forward passes.
pub type NormResult<T> = Result<T, NormError>;

/// Errors raised by [`EvoNorm`](crate::model::EvoNorm).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NormError {
    /// Rejected layer configuration; no layer is created.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Input tensor with the wrong rank or channel count.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
