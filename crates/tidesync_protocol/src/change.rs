//! Change notifications emitted by the cache.

use crate::record::Origin;

/// Kind of change applied to a cached record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Record was inserted or its payload, version or flags changed.
    Upsert,
    /// Record was removed (remote deletion, expiry or teardown).
    Remove,
}

/// A single change to the cache.
///
/// Events are emitted after the cache lock is released and carry enough to
/// decide whether to re-read the key; the current value is available via `get`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Record key.
    pub key: String,
    /// Type of change.
    pub kind: ChangeKind,
    /// Origin of the change.
    pub origin: Origin,
    /// Record version after the change (tombstone version for removals).
    pub version: u64,
}

impl ChangeEvent {
    /// Creates an upsert event.
    pub fn upsert(key: impl Into<String>, origin: Origin, version: u64) -> Self {
        Self {
            key: key.into(),
            kind: ChangeKind::Upsert,
            origin,
            version,
        }
    }

    /// Creates a removal event.
    pub fn remove(key: impl Into<String>, origin: Origin, version: u64) -> Self {
        Self {
            key: key.into(),
            kind: ChangeKind::Remove,
            origin,
            version,
        }
    }
}
