//! Error types for stateful evaluation

use agentoauth_store::StoreError;
use thiserror::Error;

/// Result type alias for state operations
pub type Result<T> = std::result::Result<T, StateError>;

/// Errors from the state manager. All of these fail the apply flow closed
/// (the evaluator answers DENY / VERIFIER_UNAVAILABLE rather than guessing).
#[derive(Error, Debug)]
pub enum StateError {
    #[error("State back-end unavailable: {0}")]
    Unavailable(String),

    /// Compare-and-set retries exhausted on a hot key
    #[error("Budget contention on {0}")]
    Contention(String),

    #[error("Corrupt state under {key}: {message}")]
    Corrupt { key: String, message: String },
}

impl From<StoreError> for StateError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(message) => StateError::Unavailable(message),
            StoreError::InvalidValue { key, message } => StateError::Corrupt { key, message },
        }
    }
}
