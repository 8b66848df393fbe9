//! Error types for Tessera

use thiserror::Error;

/// Result type alias using Tessera's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for conversion and sharding operations
#[derive(Error, Debug)]
pub enum Error {
    /// Model hyperparameters and conversion arguments disagree.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{what}: dimension {dim} is not evenly divisible by {parts}")]
    NotDivisible {
        what: String,
        dim: usize,
        parts: usize,
    },

    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Invalid shape: {0}")]
    InvalidShape(String),

    #[error("Dtype mismatch: expected {expected}, got {got}")]
    DtypeMismatch { expected: String, got: String },

    #[error("Unsupported dtype: {0}")]
    UnsupportedDtype(String),

    #[error("Weight not found: {0}")]
    WeightNotFound(String),

    #[error("Missing config field: {0}")]
    MissingField(String),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SafeTensors error: {0}")]
    SafeTensors(String),
}

impl From<safetensors::SafeTensorError> for Error {
    fn from(e: safetensors::SafeTensorError) -> Self {
        Self::SafeTensors(e.to_string())
    }
}
