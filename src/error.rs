//! Error types for the Floodgate service.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Floodgate operations.
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rule file could not be parsed
    #[error("Rule file error: {0}")]
    RuleFile(String),

    /// Shared store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A published rule payload could not be decoded
    #[error("Deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by a [`SharedStore`](crate::store::SharedStore).
///
/// A missing key is not an error; store reads return `Ok(None)` for it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached or rejected the command
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A command did not complete within the configured deadline
    #[error("store command timed out after {0:?}")]
    Timeout(Duration),

    /// A value held in the store has an unexpected shape
    #[error("malformed value for key {key}: {reason}")]
    Malformed { key: String, reason: String },
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Result type alias for Floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;
