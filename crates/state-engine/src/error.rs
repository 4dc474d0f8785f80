//! Error types for the state engine

use thiserror::Error;

/// Result type alias using StateError
pub type Result<T> = std::result::Result<T, StateError>;

/// Errors that can occur in the state engine
#[derive(Debug, Error)]
pub enum StateError {
    /// Bad registration (duplicate identity, broken builtin)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Parameters or input kind rejected before the body ran
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The operation body failed
    #[error("Operation failed: {0}")]
    Operation(String),

    /// The operation observed a cancellation request
    #[error("Operation cancelled")]
    Cancelled,

    /// The edit description cannot be applied to the current tree
    #[error("Invalid edit: {0}")]
    InvalidEdit(String),

    /// A ref that does not resolve to a cell
    #[error("Unknown ref: {0}")]
    UnknownRef(String),

    /// Object payload is not of the requested Rust type
    #[error("Object of kind '{kind}' does not hold a {expected}")]
    InvalidData { kind: String, expected: &'static str },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StateError {
    /// Create an operation error with a message
    pub fn operation(msg: impl Into<String>) -> Self {
        Self::Operation(msg.into())
    }

    /// Create a configuration error with a message
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create an invalid-edit error with a message
    pub fn invalid_edit(msg: impl Into<String>) -> Self {
        Self::InvalidEdit(msg.into())
    }

    /// Whether this error is a cancellation rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Reasons a transform instance or action invocation is rejected before
/// its body runs.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    /// Parameter values must be a JSON object (or null for defaults)
    #[error("Parameters for '{path}' must be an object")]
    NotAnObject { path: String },

    /// A value was supplied for a parameter the schema does not declare
    #[error("Unknown parameter '{name}'")]
    UnknownParam { name: String },

    /// Value has the wrong JSON type
    #[error("Parameter '{name}' expects {expected}")]
    TypeMismatch { name: String, expected: &'static str },

    /// Numeric value outside its declared bounds
    #[error("Parameter '{name}' = {value} is outside [{min}, {max}]")]
    OutOfRange { name: String, value: f64, min: f64, max: f64 },

    /// Value is not one of the declared choices
    #[error("Parameter '{name}' has no option {value}")]
    InvalidChoice { name: String, value: String },

    /// The parent object's kind is not accepted by the transformer
    #[error("'{operation}' does not accept objects of kind '{actual}' (accepts: {expected})")]
    KindMismatch {
        operation: String,
        expected: String,
        actual: String,
    },

    /// The applicability predicate rejected the target
    #[error("'{operation}' is not applicable to '{target}'")]
    NotApplicable { operation: String, target: String },

    /// The transformer in the edit is not part of the registry
    #[error("Transformer '{0}' is not registered")]
    UnregisteredTransformer(String),
}
