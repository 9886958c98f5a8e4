//! Cached records.

use crate::Payload;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Provenance of a record.
///
/// The origin decides merge priority: external data never replaces a
/// record that came from the remote store or from a local write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Written by this client through `put`.
    Local,
    /// Pushed by the remote store.
    Remote,
    /// Pulled from the external API.
    External,
}

impl Origin {
    /// Returns the lowercase name used in logs and CLI output.
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Local => "local",
            Origin::Remote => "remote",
            Origin::External => "external",
        }
    }

    /// Returns true if this origin outranks external data.
    pub fn is_authoritative(&self) -> bool {
        !matches!(self, Origin::External)
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single versioned entry in the local cache.
///
/// # Fields
///
/// - `key`: unique within the cache
/// - `version`: remote-assigned; `0` means never confirmed by the remote
/// - `payload`: structured value
/// - `origin`: provenance tag
/// - `dirty`: local write not yet acknowledged
/// - `unsynced`: a dirty write that was dropped after exhausting retries
/// - `expires_at`: freshness deadline, only for external records
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    /// Record key.
    pub key: String,
    /// Remote-assigned version.
    pub version: u64,
    /// Record payload.
    pub payload: Payload,
    /// Where the current payload came from.
    pub origin: Origin,
    /// Whether a local write is awaiting acknowledgment.
    pub dirty: bool,
    /// Whether the local write was given up on.
    pub unsynced: bool,
    /// Eviction deadline for external records.
    #[serde(skip)]
    pub expires_at: Option<Instant>,
}

impl Record {
    /// Creates an optimistic local record.
    ///
    /// The version is carried over from the previous record so that stale
    /// remote updates are still recognised while the write is in flight.
    pub fn local(key: impl Into<String>, payload: Payload, version: u64) -> Self {
        Self {
            key: key.into(),
            version,
            payload,
            origin: Origin::Local,
            dirty: true,
            unsynced: false,
            expires_at: None,
        }
    }

    /// Creates a record confirmed by the remote store.
    pub fn remote(key: impl Into<String>, payload: Payload, version: u64) -> Self {
        Self {
            key: key.into(),
            version,
            payload,
            origin: Origin::Remote,
            dirty: false,
            unsynced: false,
            expires_at: None,
        }
    }

    /// Creates a record ingested from the external API.
    pub fn external(key: impl Into<String>, payload: Payload, expires_at: Instant) -> Self {
        Self {
            key: key.into(),
            version: 0,
            payload,
            origin: Origin::External,
            dirty: false,
            unsynced: false,
            expires_at: Some(expires_at),
        }
    }

    /// Returns true if this record is external data past its freshness window.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.origin == Origin::External && self.expires_at.is_some_and(|at| at <= now)
    }

    /// Returns true if external data must not replace this record.
    pub fn blocks_external(&self) -> bool {
        self.origin.is_authoritative() || self.dirty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn local_record_is_dirty() {
        let record = Record::local("a", json!(1), 3);
        assert!(record.dirty);
        assert_eq!(record.version, 3);
        assert_eq!(record.origin, Origin::Local);
    }

    #[test]
    fn external_expiry() {
        let now = Instant::now();
        let record = Record::external("b", json!("x"), now + Duration::from_secs(10));
        assert!(!record.is_expired(now));
        assert!(record.is_expired(now + Duration::from_secs(10)));

        // Remote records never expire even with a deadline set by mistake.
        let mut remote = Record::remote("c", json!(2), 1);
        remote.expires_at = Some(now);
        assert!(!remote.is_expired(now + Duration::from_secs(1)));
    }

    #[test]
    fn merge_priority() {
        let now = Instant::now();
        assert!(Record::local("a", json!(1), 0).blocks_external());
        assert!(Record::remote("a", json!(1), 1).blocks_external());
        assert!(!Record::external("a", json!(1), now).blocks_external());
    }

    #[test]
    fn origin_serializes_lowercase() {
        let value = serde_json::to_value(Origin::External).unwrap();
        assert_eq!(value, json!("external"));
        assert_eq!(Origin::Remote.to_string(), "remote");
    }
}
