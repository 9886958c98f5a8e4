//! Identity provider abstraction.

use crate::error::AuthResult;
use crate::session::Credentials;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Tokens granted by an identity provider.
#[derive(Clone, PartialEq, Eq)]
pub struct Grant {
    /// User identifier.
    pub user_id: String,
    /// Identity token.
    pub id_token: String,
    /// Refresh token.
    pub refresh_token: String,
    /// Lifetime of the identity token.
    pub expires_in: Duration,
}

impl std::fmt::Debug for Grant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Grant")
            .field("user_id", &self.user_id)
            .field("expires_in", &self.expires_in)
            .finish_non_exhaustive()
    }
}

/// An identity provider handles credential exchange.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (hosted identity services, in-process for testing).
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Exchanges credentials for tokens.
    ///
    /// Fails with `InvalidCredentials` or `NetworkUnavailable`.
    async fn sign_in(&self, credentials: &Credentials) -> AuthResult<Grant>;

    /// Exchanges a refresh token for fresh tokens.
    ///
    /// Fails with `Expired` when the refresh token is no longer accepted.
    async fn refresh(&self, refresh_token: &str) -> AuthResult<Grant>;
}

#[async_trait]
impl<P: AuthProvider + ?Sized> AuthProvider for Arc<P> {
    async fn sign_in(&self, credentials: &Credentials) -> AuthResult<Grant> {
        (**self).sign_in(credentials).await
    }

    async fn refresh(&self, refresh_token: &str) -> AuthResult<Grant> {
        (**self).refresh(refresh_token).await
    }
}
