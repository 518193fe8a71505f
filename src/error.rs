//! Error types for the Tollgate service.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Tollgate operations.
///
/// Every variant is a start-up or configuration failure. Nothing here is
/// produced while serving a request.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A policy name that the registry does not know about
    #[error("Rate limit policy not found: {0}")]
    PolicyNotFound(String),

    /// A policy definition with a zero limit or window
    #[error("Invalid rate limit policy '{name}': {reason}")]
    InvalidPolicy { name: String, reason: String },

    /// HTTP server errors
    #[error("Server error: {0}")]
    Server(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for TollgateError {
    fn from(err: config::ConfigError) -> Self {
        TollgateError::Config(err.to_string())
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;

/// Failure talking to the shared counter store.
///
/// These never leave the distributed limiter: they are mapped to a
/// fail-open decision in exactly one place.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Distributed mode is off or has no credentials
    #[error("shared store is disabled")]
    Disabled,

    /// The call did not complete within the configured bound
    #[error("shared store call timed out after {0:?}")]
    Timeout(Duration),

    /// The store answered but not in the expected shape, or is down
    #[error("shared store unavailable: {0}")]
    Unavailable(String),

    /// Redis client errors
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}
