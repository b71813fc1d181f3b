#![forbid(unsafe_code)]

//! Throttle manager errors. None of them escape the manager: unreadable state
//! is replaced by fresh state, and storage failures are logged and mean
//! "not sent".

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ThrottleError {
    /// The storage backend refused the operation.
    #[error("throttle storage unavailable: {0}")]
    Storage(String),

    /// Persisted state could not be encoded or decoded.
    #[error("invalid throttle state: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ThrottleError>;
