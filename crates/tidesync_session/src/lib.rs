//! # TideSync Session
//!
//! Owns the authenticated identity and its lifecycle.
//!
//! This crate provides:
//! - `Session`, the explicit value handed to the other components
//! - `SessionManager`, an explicit state machine
//!   (unauthenticated → authenticating → authenticated → refreshing → …)
//! - Single-flight token refresh shared by concurrent callers
//! - `SessionObserver` hooks so sign-out tears down dependent state before returning
//! - `HmacAuthProvider`, an in-process provider issuing HMAC-SHA256 tokens
//!
//! ## Key Invariants
//!
//! - Only one refresh is in flight per manager
//! - Refresh is never retried silently; callers ask for it
//! - A refresh that completes after sign-out is discarded
//! - Observers finish teardown before `sign_out` returns

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod manager;
mod provider;
mod session;
mod token;

pub use config::SessionConfig;
pub use error::{AuthError, AuthResult};
pub use manager::{SessionManager, SessionObserver, SessionState};
pub use provider::{AuthProvider, Grant};
pub use session::{Credentials, Session};
pub use token::{HmacAuthProvider, TokenClaims, TokenError, TokenKind, TokenVerifier};
