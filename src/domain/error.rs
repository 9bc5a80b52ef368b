//! Error taxonomy for the alert pipeline

use thiserror::Error;

/// Errors surfaced by zone lookup, ingestion, persistence and fan-out
///
/// `Validation`/`InvalidArgument` are caller mistakes and are never retried.
/// The `*Unavailable` variants are safe to retry with backoff.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AlertError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid field `{field}`: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("zone directory unavailable: {0}")]
    DirectoryUnavailable(String),

    #[error("notification store unavailable: {0}")]
    StoreUnavailable(String),
}

impl AlertError {
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        AlertError::Validation { field, reason: reason.into() }
    }

    pub fn missing(field: &'static str) -> Self {
        AlertError::Validation { field, reason: "is required".to_string() }
    }

    /// True for backend failures a caller may retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, AlertError::DirectoryUnavailable(_) | AlertError::StoreUnavailable(_))
    }

    /// Stable snake_case label used in logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            AlertError::InvalidArgument(_) => "invalid_argument",
            AlertError::Validation { .. } => "validation",
            AlertError::NotFound(_) => "not_found",
            AlertError::DirectoryUnavailable(_) => "directory_unavailable",
            AlertError::StoreUnavailable(_) => "store_unavailable",
        }
    }
}
