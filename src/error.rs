//! Error types for the Tokengate service.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Tokengate operations.
#[derive(Error, Debug)]
pub enum TokengateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Bucket store errors surfaced to administrative callers
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// gRPC server errors
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::transport::Error),
}

impl From<config::ConfigError> for TokengateError {
    fn from(err: config::ConfigError) -> Self {
        TokengateError::Config(err.to_string())
    }
}

/// Failures of a bucket store.
///
/// None of these reach a rate-limited caller: the limiter fails open on
/// every variant. They are only returned as-is from the administrative
/// `reset` and `inspect` operations.
#[derive(Error, Debug)]
pub enum BackendError {
    /// The store could not be reached or rejected the command.
    #[error("Backend unavailable: {0}")]
    Unavailable(#[from] redis::RedisError),

    /// The store did not answer within the configured command timeout.
    #[error("Backend timed out after {0:?}")]
    Timeout(Duration),

    /// A stored record or a reply could not be parsed.
    #[error("Malformed bucket state: {0}")]
    MalformedState(String),
}

/// Result type alias for Tokengate operations.
pub type Result<T> = std::result::Result<T, TokengateError>;
