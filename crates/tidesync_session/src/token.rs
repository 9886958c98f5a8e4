//! In-process identity provider backed by HMAC-SHA256 tokens.
//!
//! ## Token Format
//!
//! A token is two base64url (unpadded) segments joined by `.`:
//! - claims: `kind|user_id|issued_at_millis|expires_at_millis`
//! - HMAC-SHA256 signature over the encoded claims segment
//!
//! The reference remote store verifies identity tokens with a
//! `TokenVerifier` sharing the provider's secret.

use crate::error::{AuthError, AuthResult};
use crate::provider::{AuthProvider, Grant};
use crate::session::Credentials;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use sha2::Sha256;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Errors raised while verifying a token.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// The token is not in the expected format.
    #[error("malformed token")]
    Malformed,
    /// The signature does not match.
    #[error("invalid signature")]
    BadSignature,
    /// The token is past its expiry.
    #[error("token expired")]
    Expired,
    /// An identity token was expected but a refresh token was given, or vice versa.
    #[error("wrong token kind")]
    WrongKind,
}

/// Kind of token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Short-lived identity token.
    Id,
    /// Long-lived refresh token.
    Refresh,
}

impl TokenKind {
    fn tag(&self) -> &'static str {
        match self {
            TokenKind::Id => "id",
            TokenKind::Refresh => "rt",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "id" => Some(TokenKind::Id),
            "rt" => Some(TokenKind::Refresh),
            _ => None,
        }
    }
}

/// Verified contents of a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenClaims {
    /// Token kind.
    pub kind: TokenKind,
    /// User identifier.
    pub user_id: String,
    /// Issue time, Unix millis.
    pub issued_at: u64,
    /// Expiry time, Unix millis.
    pub expires_at: u64,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Signs and verifies tokens with a shared secret.
#[derive(Clone)]
pub struct TokenVerifier {
    secret: Vec<u8>,
}

impl TokenVerifier {
    /// Creates a verifier for the given secret.
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC accepts keys of any length, so this cannot fail.
        match HmacSha256::new_from_slice(&self.secret) {
            Ok(mac) => mac,
            Err(_) => unreachable!("HMAC can take key of any size"),
        }
    }

    /// Issues a token.
    pub fn issue(&self, kind: TokenKind, user_id: &str, lifetime: Duration) -> String {
        let issued_at = now_millis();
        let expires_at = issued_at + lifetime.as_millis() as u64;
        let claims = format!("{}|{}|{}|{}", kind.tag(), user_id, issued_at, expires_at);
        let encoded = URL_SAFE_NO_PAD.encode(claims.as_bytes());

        let mut mac = self.mac();
        mac.update(encoded.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        format!("{encoded}.{signature}")
    }

    /// Verifies a token's signature, kind and expiry.
    pub fn verify(&self, token: &str, expected: TokenKind) -> Result<TokenClaims, TokenError> {
        let (encoded, signature) = token.split_once('.').ok_or(TokenError::Malformed)?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| TokenError::Malformed)?;

        let mut mac = self.mac();
        mac.update(encoded.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| TokenError::BadSignature)?;

        let claims = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| TokenError::Malformed)?;
        let claims = String::from_utf8(claims).map_err(|_| TokenError::Malformed)?;

        let mut parts = claims.split('|');
        let kind = parts
            .next()
            .and_then(TokenKind::from_tag)
            .ok_or(TokenError::Malformed)?;
        let user_id = parts.next().ok_or(TokenError::Malformed)?.to_string();
        let issued_at = parts
            .next()
            .and_then(|p| p.parse::<u64>().ok())
            .ok_or(TokenError::Malformed)?;
        let expires_at = parts
            .next()
            .and_then(|p| p.parse::<u64>().ok())
            .ok_or(TokenError::Malformed)?;
        if parts.next().is_some() {
            return Err(TokenError::Malformed);
        }

        if kind != expected {
            return Err(TokenError::WrongKind);
        }
        if now_millis() >= expires_at {
            return Err(TokenError::Expired);
        }

        Ok(TokenClaims {
            kind,
            user_id,
            issued_at,
            expires_at,
        })
    }
}

struct Account {
    password: String,
    user_id: String,
}

/// An identity provider that keeps accounts in memory and issues signed tokens.
///
/// Useful for tests and demos. It can be switched offline to simulate an
/// unreachable provider, and refresh tokens can be revoked per user.
pub struct HmacAuthProvider {
    verifier: TokenVerifier,
    accounts: RwLock<HashMap<String, Account>>,
    revoked: RwLock<HashSet<String>>,
    id_lifetime: Duration,
    refresh_lifetime: Duration,
    online: AtomicBool,
    latency: RwLock<Duration>,
    refresh_calls: AtomicU64,
}

impl HmacAuthProvider {
    /// Creates a provider signing with `secret`.
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            verifier: TokenVerifier::new(secret),
            accounts: RwLock::new(HashMap::new()),
            revoked: RwLock::new(HashSet::new()),
            id_lifetime: Duration::from_secs(60 * 60),
            refresh_lifetime: Duration::from_secs(30 * 24 * 60 * 60),
            online: AtomicBool::new(true),
            latency: RwLock::new(Duration::ZERO),
            refresh_calls: AtomicU64::new(0),
        }
    }

    /// Sets the identity token lifetime.
    pub fn with_id_lifetime(mut self, lifetime: Duration) -> Self {
        self.id_lifetime = lifetime;
        self
    }

    /// Registers an account and returns its user id.
    pub fn add_user(&self, email: &str, password: &str) -> String {
        let user_id = Uuid::new_v4().to_string();
        self.accounts.write().insert(
            email.to_string(),
            Account {
                password: password.to_string(),
                user_id: user_id.clone(),
            },
        );
        user_id
    }

    /// Rejects every refresh token issued so far to `user_id`.
    pub fn revoke(&self, user_id: &str) {
        self.revoked.write().insert(user_id.to_string());
    }

    /// Switches the provider on or offline.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Adds an artificial delay to every call.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write() = latency;
    }

    /// Returns a verifier sharing this provider's secret.
    pub fn verifier(&self) -> TokenVerifier {
        self.verifier.clone()
    }

    /// Returns how many refresh calls reached the provider.
    pub fn refresh_calls(&self) -> u64 {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    async fn simulate_network(&self) -> AuthResult<()> {
        let latency = *self.latency.read();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if !self.online.load(Ordering::SeqCst) {
            return Err(AuthError::network("identity provider unreachable"));
        }
        Ok(())
    }

    fn grant(&self, user_id: &str) -> Grant {
        Grant {
            user_id: user_id.to_string(),
            id_token: self.verifier.issue(TokenKind::Id, user_id, self.id_lifetime),
            refresh_token: self
                .verifier
                .issue(TokenKind::Refresh, user_id, self.refresh_lifetime),
            expires_in: self.id_lifetime,
        }
    }
}

#[async_trait]
impl AuthProvider for HmacAuthProvider {
    async fn sign_in(&self, credentials: &Credentials) -> AuthResult<Grant> {
        self.simulate_network().await?;

        let user_id = {
            let accounts = self.accounts.read();
            match accounts.get(&credentials.email) {
                Some(account) if account.password == credentials.password => {
                    account.user_id.clone()
                }
                _ => return Err(AuthError::InvalidCredentials),
            }
        };

        // Signing in again lifts an earlier revocation.
        self.revoked.write().remove(&user_id);
        Ok(self.grant(&user_id))
    }

    async fn refresh(&self, refresh_token: &str) -> AuthResult<Grant> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_network().await?;

        let claims = self
            .verifier
            .verify(refresh_token, TokenKind::Refresh)
            .map_err(|_| AuthError::Expired)?;
        if self.revoked.read().contains(&claims.user_id) {
            return Err(AuthError::Expired);
        }
        Ok(self.grant(&claims.user_id))
    }
}
