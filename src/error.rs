//! Error types for the Tollgate service.

use thiserror::Error;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A request that can never be valid (empty key, NaN rate, ...)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The request asked for more permits than the limiter's burst.
    #[error("rate: wait(n={n}) would exceed the burst of limiter '{key}'")]
    BurstExceeded { key: String, n: u32 },

    /// The request exceeds the burst, or cannot be granted within the caller's wait bound.
    #[error("rate: wait(n={n}) would either exceed the burst of limiter '{key}' or the provided max wait")]
    WaitExceeded { key: String, n: u32 },

    /// State storage failures
    #[error("Storage error: {0}")]
    Storage(String),

    /// The caller gave up while waiting on a reservation
    #[error("Wait cancelled")]
    Cancelled,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// (De)serialization of persisted state
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// gRPC transport errors
    #[cfg(feature = "grpc")]
    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// A remote call returned a non-OK status
    #[cfg(feature = "grpc")]
    #[error("RPC failed ({code:?}): {message}")]
    Rpc { code: tonic::Code, message: String },
}

impl TollgateError {
    /// Whether retrying the same call later may succeed.
    ///
    /// Rate-limit rejections are terminal: retrying the identical request
    /// immediately cannot succeed before the computed wait has elapsed.
    pub fn is_retryable(&self) -> bool {
        match self {
            TollgateError::Storage(_) | TollgateError::Io(_) => true,
            #[cfg(feature = "grpc")]
            TollgateError::Transport(_) => true,
            #[cfg(feature = "grpc")]
            TollgateError::Rpc { code, .. } => matches!(
                code,
                tonic::Code::Unavailable | tonic::Code::DeadlineExceeded | tonic::Code::Aborted
            ),
            _ => false,
        }
    }

    /// Whether this error is a capacity rejection.
    pub fn is_rate_limited(&self) -> bool {
        matches!(
            self,
            TollgateError::BurstExceeded { .. } | TollgateError::WaitExceeded { .. }
        )
    }

    /// HTTP-equivalent status code.
    pub fn http_status(&self) -> u16 {
        match self {
            TollgateError::BurstExceeded { .. } | TollgateError::WaitExceeded { .. } => 429,
            TollgateError::InvalidArgument(_) => 400,
            TollgateError::Cancelled => 499,
            TollgateError::Storage(_) => 503,
            _ => 500,
        }
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
