//! Error types for the state back-end

use thiserror::Error;

/// Result type alias for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by a state back-end
#[derive(Error, Debug)]
pub enum StoreError {
    /// The back-end cannot be reached; callers on the apply path must
    /// fail closed on this.
    #[error("State back-end unavailable: {0}")]
    Unavailable(String),

    /// A stored value could not be interpreted (e.g. a non-numeric
    /// counter)
    #[error("Invalid value under key {key}: {message}")]
    InvalidValue { key: String, message: String },
}
