//! Error types for the sync engine.

use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// The session was rejected or has expired. Never retried.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The remote store could not be reached.
    #[error("remote unreachable: {0}")]
    Unreachable(String),

    /// A write was abandoned after exhausting its retries.
    #[error("write to {key} failed after {attempts} attempts")]
    WriteFailed {
        /// Record key.
        key: String,
        /// Delivery attempts made.
        attempts: u32,
    },

    /// A later write to the same key replaced this one.
    #[error("write to {key} superseded by a newer write")]
    Superseded {
        /// Record key.
        key: String,
    },

    /// A newer remote version won over the write.
    #[error("write to {key} overridden by remote version {version}")]
    Overridden {
        /// Record key.
        key: String,
        /// Winning remote version.
        version: u64,
    },

    /// The engine closed before the operation completed.
    #[error("sync cancelled")]
    Cancelled,

    /// No session is bound to the engine.
    #[error("sync engine is not open")]
    NotOpen,

    /// A remote call did not complete in time.
    #[error("operation timed out")]
    Timeout,
}

impl SyncError {
    /// Creates an unreachable error.
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::Unreachable(message.into())
    }

    /// Creates an unauthorized error.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Unreachable(_) | SyncError::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::unreachable("connection lost").is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(!SyncError::unauthorized("bad token").is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
        assert!(!SyncError::NotOpen.is_retryable());
    }

    #[test]
    fn error_display() {
        let err = SyncError::NotOpen;
        assert_eq!(err.to_string(), "sync engine is not open");

        let err = SyncError::WriteFailed {
            key: "a".into(),
            attempts: 5,
        };
        assert!(err.to_string().contains("5"));

        let err = SyncError::Overridden {
            key: "a".into(),
            version: 9,
        };
        assert!(err.to_string().contains("9"));
    }
}
