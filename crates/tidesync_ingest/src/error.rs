//! Error types for the ingestion pipeline.

use thiserror::Error;

/// Result type for ingestion operations.
pub type IngestResult<T> = Result<T, IngestError>;

/// Errors that can occur while ingesting external data.
///
/// The type is `Clone` so one cycle result can be shared by every caller
/// that joined it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IngestError {
    /// The source could not be reached or answered with an error status.
    #[error("network error: {message}")]
    Network {
        /// Error message.
        message: String,
        /// Whether the fetch can be retried.
        retryable: bool,
    },

    /// The response body could not be parsed at all.
    #[error("parse error: {0}")]
    Parse(String),

    /// The source rejected the credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// No session is active, so no cycle may run.
    #[error("no active session")]
    NoSession,

    /// The cycle was abandoned before it completed.
    #[error("ingestion cancelled")]
    Cancelled,
}

impl IngestError {
    /// Creates a retryable network error.
    pub fn network_retryable(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable network error.
    pub fn network_fatal(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, IngestError::Network { retryable: true, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(IngestError::network_retryable("HTTP 503").is_retryable());
        assert!(!IngestError::network_fatal("HTTP 404").is_retryable());
        assert!(!IngestError::Unauthorized("HTTP 401".into()).is_retryable());
        assert!(!IngestError::Parse("bad json".into()).is_retryable());
        assert!(!IngestError::NoSession.is_retryable());
    }

    #[test]
    fn error_display() {
        assert_eq!(IngestError::NoSession.to_string(), "no active session");
        assert!(IngestError::network_fatal("HTTP 404")
            .to_string()
            .contains("404"));
    }
}
