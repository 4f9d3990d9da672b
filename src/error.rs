//! Error taxonomy for the knowledge core.
//!
//! Validation and auth errors are detected at the boundary and never
//! retried. Dependency failures (embedding, storage) are retried with a
//! bounded backoff inside the coordinator / query service and surface as
//! `Embedding` / `Upstream` only after retries are exhausted.

use std::time::Duration;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// All failure modes surfaced by the core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad caller input. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// A requested entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Id collision on ingestion; caller must pick a new id or accept overwrite.
    #[error("duplicate id: {0}")]
    DuplicateId(String),

    /// Missing or invalid credential.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Valid credential, insufficient tier for the operation.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Per-tier quota exceeded. Carries the wait until the window resets.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// Embedding provider failure after retries.
    #[error("embedding error: {0}")]
    Embedding(String),

    /// Document store or vector index failure after retries.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Unexpected internal failure. Always logged with a correlation id.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Machine-readable code used in the wire error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::DuplicateId(_) => "DUPLICATE_ID",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::Embedding(_) => "UPSTREAM_ERROR",
            Self::Upstream(_) => "UPSTREAM_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the failure is attributable to the caller (4xx family).
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::NotFound(_)
                | Self::DuplicateId(_)
                | Self::Unauthorized(_)
                | Self::Forbidden(_)
                | Self::RateLimited { .. }
        )
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => Self::NotFound("row not found".to_string()),
            other => Self::Upstream(format!("database: {other}")),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(format!("serialization: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(Error::Validation("x".into()).code(), "VALIDATION_ERROR");
        assert_eq!(Error::NotFound("x".into()).code(), "NOT_FOUND");
        assert_eq!(Error::DuplicateId("x".into()).code(), "DUPLICATE_ID");
        assert_eq!(Error::Unauthorized("x".into()).code(), "UNAUTHORIZED");
        assert_eq!(Error::Forbidden("x".into()).code(), "FORBIDDEN");
        assert_eq!(
            Error::RateLimited {
                retry_after: Duration::from_secs(1)
            }
            .code(),
            "RATE_LIMITED"
        );
        assert_eq!(Error::Upstream("x".into()).code(), "UPSTREAM_ERROR");
        assert_eq!(Error::Internal("x".into()).code(), "INTERNAL_ERROR");
    }

    #[test]
    fn test_caller_error_split() {
        assert!(Error::Validation("x".into()).is_caller_error());
        assert!(Error::Forbidden("x".into()).is_caller_error());
        assert!(!Error::Upstream("x".into()).is_caller_error());
        assert!(!Error::Internal("x".into()).is_caller_error());
    }
}
