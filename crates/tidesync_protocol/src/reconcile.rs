//! Reconciliation of remote updates against local state.

use crate::event::RemoteEvent;
use crate::pending::PendingWrite;

/// Decision taken for one incoming remote update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// The update acknowledges the pending write for the key.
    Acknowledge,
    /// The update confirms an earlier write of ours that a newer local write
    /// already replaced. The version advances; the local payload stays dirty.
    AdvanceVersion,
    /// The update is newer than local state and replaces it.
    AcceptRemote,
    /// The update is stale (or a tie) and is dropped.
    Discard,
}

impl Reconciliation {
    /// Returns true if the decision changes cached state.
    pub fn changes_state(&self) -> bool {
        !matches!(self, Reconciliation::Discard)
    }
}

/// Final outcome of a local write, reported to whoever issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The remote store assigned this version to the write.
    Acknowledged(u64),
    /// A later write to the same key replaced this one before it was acknowledged.
    Superseded,
    /// A newer remote version won over the write.
    Overridden(u64),
    /// Delivery was abandoned after this many attempts.
    Failed(u32),
    /// The session ended before the write settled.
    Cancelled,
}

/// Resolves a remote update against the local version of its key.
///
/// `local_version` is the version of the cached record, the tombstone
/// version of a deleted key, or `0` when the key is unknown.
///
/// Rules, in order:
/// 1. An update produced by the pending write for the key acknowledges it.
/// 2. An update produced by a superseded write of ours only advances the version.
/// 3. A strictly newer version replaces local state (remote wins).
/// 4. Anything else is stale; an equal version means the remote is already
///    consistent with what we hold.
pub fn reconcile(
    local_version: u64,
    pending: Option<&PendingWrite>,
    event: &RemoteEvent,
) -> Reconciliation {
    if let (Some(pending), Some(write_id)) = (pending, event.write_id.as_ref()) {
        if !event.deleted {
            if pending.write_id == *write_id {
                return Reconciliation::Acknowledge;
            }
            if pending.is_superseded(write_id) {
                return if event.version > local_version {
                    Reconciliation::AdvanceVersion
                } else {
                    Reconciliation::Discard
                };
            }
        }
    }

    if event.version <= local_version {
        return Reconciliation::Discard;
    }

    // An upsert without a payload carries nothing to apply.
    if !event.deleted && event.payload.is_none() {
        return Reconciliation::Discard;
    }

    Reconciliation::AcceptRemote
}
