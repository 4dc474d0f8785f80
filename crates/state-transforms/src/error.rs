//! Failures of the built-in templates

use state_engine::StateError;
use thiserror::Error;

/// Errors raised by built-in transform bodies
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransformError {
    /// Path does not resolve and no default was given
    #[error("Path '{path}' not found")]
    PathNotFound { path: String },

    /// Value cannot be read as a finite number
    #[error("Expected a number, got {value}")]
    NotNumeric { value: String },

    /// Non-numeric element inside an array
    #[error("Element {index} is not a number: {value}")]
    NotNumericAt { index: usize, value: String },

    /// Input is not an array
    #[error("Expected an array, got {0}")]
    NotAnArray(String),

    /// Statistics over nothing
    #[error("No numeric values to summarize")]
    Empty,
}

impl From<TransformError> for StateError {
    fn from(err: TransformError) -> Self {
        StateError::operation(err.to_string())
    }
}
