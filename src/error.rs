//! Error types for ratewarden.

use thiserror::Error;

/// Main error type for ratewarden operations.
#[derive(Error, Debug)]
pub enum RatewardenError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage backend failures that are not tied to a specific client
    #[error("Storage error: {0}")]
    Storage(String),

    /// Redis client errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Result type alias for ratewarden operations.
pub type Result<T> = std::result::Result<T, RatewardenError>;
