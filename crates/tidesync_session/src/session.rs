//! The session value.

use std::fmt;
use std::time::{Duration, SystemTime};

/// An authenticated identity and its validity window.
///
/// Sessions are immutable; a refresh produces a new `Session` with a higher
/// `generation` that replaces the old one atomically.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    user_id: String,
    id_token: String,
    refresh_token: String,
    expires_at: SystemTime,
    generation: u64,
}

impl Session {
    /// Creates a session.
    pub fn new(
        user_id: impl Into<String>,
        id_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_at: SystemTime,
        generation: u64,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            id_token: id_token.into(),
            refresh_token: refresh_token.into(),
            expires_at,
            generation,
        }
    }

    /// Returns the user identifier.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Returns the identity token presented to remote services.
    pub fn id_token(&self) -> &str {
        &self.id_token
    }

    /// Returns the token used to obtain a new identity token.
    pub fn refresh_token(&self) -> &str {
        &self.refresh_token
    }

    /// Returns when the identity token stops being valid.
    pub fn expires_at(&self) -> SystemTime {
        self.expires_at
    }

    /// Returns how many times this session has been refreshed.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns true if the identity token has expired.
    pub fn is_expired(&self) -> bool {
        SystemTime::now() >= self.expires_at
    }

    /// Returns true if the identity token expires within `skew`.
    pub fn expires_within(&self, skew: Duration) -> bool {
        SystemTime::now() + skew >= self.expires_at
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("expires_at", &self.expires_at)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Credentials presented to `authenticate`.
#[derive(Clone)]
pub struct Credentials {
    /// Account email.
    pub email: String,
    /// Account password.
    pub password: String,
}

impl Credentials {
    /// Creates email/password credentials.
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_tokens() {
        let session = Session::new(
            "user-1",
            "secret-id-token",
            "secret-refresh",
            SystemTime::now() + Duration::from_secs(60),
            0,
        );
        let rendered = format!("{session:?}");
        assert!(rendered.contains("user-1"));
        assert!(!rendered.contains("secret"));

        let creds = Credentials::new("a@b.c", "hunter2");
        assert!(!format!("{creds:?}").contains("hunter2"));
    }

    #[test]
    fn expiry_checks() {
        let live = Session::new("u", "t", "r", SystemTime::now() + Duration::from_secs(600), 0);
        assert!(!live.is_expired());
        assert!(!live.expires_within(Duration::from_secs(60)));
        assert!(live.expires_within(Duration::from_secs(3600)));

        let dead = Session::new("u", "t", "r", SystemTime::now() - Duration::from_secs(1), 0);
        assert!(dead.is_expired());
    }
}
