use std::time::Duration;
use thiserror::Error;

/// Result type for limiter operations
pub type Result<T> = std::result::Result<T, RateLimitError>;

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors returned by limiters and the limiter service
#[derive(Error, Debug)]
pub enum RateLimitError {
    /// Rejected policy or service configuration. Returned from constructors.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Rejected argument to an administrative or decision call.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The backing store failed. Never retried by the limiter.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Failures of the backing atomic store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Unknown atomic script: {0}")]
    UnknownScript(String),

    #[error("Invalid invocation of {script}: {detail}")]
    InvalidInvocation { script: String, detail: String },

    #[error("Unexpected reply from {operation}: {detail}")]
    UnexpectedReply { operation: String, detail: String },

    #[error("Value at key {0} is not an integer")]
    WrongType(String),

    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),
}

impl RateLimitError {
    /// Short label used in logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            RateLimitError::Configuration(_) => "configuration",
            RateLimitError::Validation(_) => "validation",
            RateLimitError::Store(_) => "store",
        }
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        RateLimitError::Configuration(msg.into())
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        RateLimitError::Validation(msg.into())
    }
}
