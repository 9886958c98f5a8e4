//! Error type for the client facade.

use thiserror::Error;
use tidesync_engine::SyncError;
use tidesync_ingest::IngestError;
use tidesync_session::AuthError;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by [`Client`](crate::Client).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Sign-in or refresh failed.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// The sync engine failed.
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// An ingestion cycle failed.
    #[error(transparent)]
    Ingest(#[from] IngestError),
}

impl ClientError {
    /// Returns true if trying again later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Auth(e) => e.is_transient(),
            ClientError::Sync(e) => e.is_retryable(),
            ClientError::Ingest(e) => e.is_retryable(),
        }
    }
}
