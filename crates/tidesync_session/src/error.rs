//! Error types for the session manager.

use thiserror::Error;

/// Result type for session operations.
pub type AuthResult<T> = Result<T, AuthError>;

/// Errors that can occur during authentication and refresh.
///
/// The type is `Clone` so a single refresh result can be handed to every
/// caller waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The credentials were rejected.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// The session can no longer be refreshed.
    #[error("session expired")]
    Expired,

    /// The identity provider could not be reached in time.
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    /// The session was signed out while the operation was in flight.
    #[error("signed out during operation")]
    SignedOut,

    /// The operation needs an active session.
    #[error("not authenticated")]
    NotAuthenticated,
}

impl AuthError {
    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkUnavailable(message.into())
    }

    /// Returns true if trying again later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, AuthError::NetworkUnavailable(_))
    }
}
