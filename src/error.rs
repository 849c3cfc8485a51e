//! Error types shared across the ingestion and retrieval pipelines.
//!
//! The variants map onto distinct handling policies rather than onto the
//! modules that produce them:
//!
//! | Variant | Policy |
//! |---------|--------|
//! | `Validation` | reject the request (HTTP 400) |
//! | `NotFound` | reject the request (HTTP 404) |
//! | `Duplicate` | not fatal; surfaces as a skip counter during ingestion |
//! | `RateLimited` | retried with exponential backoff, max 3 attempts |
//! | `External` | non-retryable upstream failure; chunk skipped where applicable |
//! | `Database` | transient or fatal storage failure; bubbles up to the caller |
//! | `Cancelled` | user- or shutdown-triggered cancellation |
//! | `Config` | misconfiguration at boot; process exits non-zero |

use thiserror::Error;

/// Library error type.
#[derive(Debug, Error)]
pub enum RecallError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate document: {0}")]
    Duplicate(String),

    #[error("rate limited by {service}: {message}")]
    RateLimited { service: String, message: String },

    #[error("{service} request failed: {message}")]
    External { service: String, message: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl RecallError {
    /// True for errors that a caller may reasonably retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RecallError::RateLimited { .. })
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        RecallError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        RecallError::NotFound(msg.into())
    }

    pub fn external(service: impl Into<String>, msg: impl Into<String>) -> Self {
        RecallError::External {
            service: service.into(),
            message: msg.into(),
        }
    }

    pub fn rate_limited(service: impl Into<String>, msg: impl Into<String>) -> Self {
        RecallError::RateLimited {
            service: service.into(),
            message: msg.into(),
        }
    }
}

/// Result type alias using [`RecallError`].
pub type Result<T> = std::result::Result<T, RecallError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_is_retryable() {
        let err = RecallError::rate_limited("embeddings", "429");
        assert!(err.is_retryable());
    }

    #[test]
    fn external_is_not_retryable() {
        let err = RecallError::external("embeddings", "500");
        assert!(!err.is_retryable());
    }

    #[test]
    fn messages_are_human_readable() {
        let err = RecallError::validation("query must not be empty");
        assert_eq!(err.to_string(), "invalid input: query must not be empty");
    }
}
