use std::time::Duration;

use thiserror::Error;

use crate::models::ErrorKind;

/// Application-wide error types for Trawl.
#[derive(Error, Debug)]
pub enum AppError {
    /// Timeout, connection reset, 5xx, 408 or 429. Retried per policy.
    #[error("Transient network error ({kind}): {message}")]
    TransientNetworkError { kind: ErrorKind, message: String },

    /// 4xx other than 408/429.
    #[error("HTTP {status} for {url}")]
    PermanentHttpError { status: u16, url: String },

    #[error("Unsupported content type: {0}")]
    UnsupportedContentType(String),

    /// The parser rejected a fetched page. The fetch is not retried.
    #[error("Parse error: {0}")]
    ParseError(String),

    /// No proxy is eligible right now (all capped or cooling down).
    #[error("No proxy available, retry after {}ms", .retry_after.as_millis())]
    ProxyExhaustedError { retry_after: Duration },

    /// The storage sink failed a whole batch.
    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Circuit breaker tripped after {consecutive_failures} consecutive fetch failures")]
    CircuitBreakerTripped { consecutive_failures: u32 },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Unknown parser '{name}'. Available parsers: {}", .available.join(", "))]
    UnknownParser { name: String, available: Vec<String> },

    #[error("Parser '{0}' is already registered")]
    DuplicateParser(String),

    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// HTTP client construction or other non-classified transport failure.
    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::TransientNetworkError { .. } | AppError::ProxyExhaustedError { .. }
        )
    }

    /// Returns true if this error counts as a fetch failure for the job-level breaker.
    pub fn should_trip_circuit(&self) -> bool {
        matches!(
            self,
            AppError::TransientNetworkError { .. }
                | AppError::PermanentHttpError { .. }
                | AppError::HttpError(_)
        )
    }

    /// Errors that end the whole job rather than a single item.
    pub fn is_systemic(&self) -> bool {
        matches!(
            self,
            AppError::ProxyExhaustedError { .. }
                | AppError::StorageError(_)
                | AppError::CircuitBreakerTripped { .. }
        )
    }
}
