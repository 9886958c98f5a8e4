//! Session-scoped record cache.
//!
//! The cache is the single merge gate for every source of change: local
//! writes, remote events and external data all pass through it under one
//! write lock, so reconciliation and the pending-write queue can never be
//! observed half-applied.
//!
//! Every mutation that may be the result of slow I/O carries the *epoch*
//! it was started under. The epoch advances whenever the cache is bound to
//! a new session or unbound, and a mutation from an older epoch is ignored.

use crate::change_feed::ChangeFeed;
use crate::config::RetryConfig;
use crate::error::{SyncError, SyncResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Instant;
use tidesync_protocol::{
    reconcile, ChangeEvent, Enqueued, Origin, Payload, PendingQueue,
    PendingWrite, Reconciliation, Record, RemoteEvent, WriteId, WriteOutcome, WriteRequest,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::watch;
use tracing::debug;

/// The session a cache is currently bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheScope {
    /// User the cached data belongs to.
    pub user_id: String,
    /// Binding counter; stale work compares against it.
    pub epoch: u64,
}

/// Result of applying one remote event.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteApplied {
    /// Reconciliation decision taken.
    pub decision: Reconciliation,
    /// Pending write settled by the event, with its outcome.
    pub resolved: Option<(WriteId, WriteOutcome)>,
}

/// Counts from merging one batch of external items.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExternalMerge {
    /// Keys that were not cached before.
    pub inserted: usize,
    /// External records replaced by fresher data.
    pub refreshed: usize,
    /// Items rejected because a remote, local or deleted record owns the key.
    pub skipped: usize,
}

#[derive(Default)]
struct CacheInner {
    scope: Option<CacheScope>,
    last_epoch: u64,
    records: HashMap<String, Record>,
    tombstones: HashMap<String, u64>,
    pending: PendingQueue,
}

impl CacheInner {
    fn is_epoch(&self, epoch: u64) -> bool {
        self.scope.as_ref().map(|s| s.epoch) == Some(epoch)
    }

    fn local_version(&self, key: &str) -> u64 {
        self.records
            .get(key)
            .map(|r| r.version)
            .or_else(|| self.tombstones.get(key).copied())
            .unwrap_or(0)
    }

    /// Drops all data; returns the removal events and the abandoned writes.
    fn clear(&mut self) -> (Vec<ChangeEvent>, Vec<PendingWrite>) {
        let mut keys: Vec<_> = self.records.drain().map(|(_, r)| r).collect();
        keys.sort_by(|a, b| a.key.cmp(&b.key));
        let events = keys
            .into_iter()
            .map(|r| ChangeEvent::remove(r.key, r.origin, r.version))
            .collect();
        self.tombstones.clear();
        (events, self.pending.drain())
    }
}

/// Key to record map scoped to one authenticated session.
///
/// # Invariants
///
/// - No two records share a key
/// - At most one pending write per key, and only for a dirty record
/// - Emptied whenever the bound session changes
pub struct Cache {
    inner: RwLock<CacheInner>,
    feed: ChangeFeed,
    /// Current epoch, `None` while unbound. Updated under the write lock.
    epochs: watch::Sender<Option<u64>>,
}

impl Cache {
    /// Creates an unbound, empty cache.
    pub fn new() -> Self {
        let (epochs, _) = watch::channel(None);
        Self {
            inner: RwLock::new(CacheInner::default()),
            feed: ChangeFeed::new(),
            epochs,
        }
    }

    /// Binds the cache to a user.
    ///
    /// Binding the user already bound keeps the data and the epoch.
    /// Binding a different user clears everything first. Returns the
    /// current epoch and any pending writes that were abandoned.
    pub fn bind(&self, user_id: &str) -> (u64, Vec<PendingWrite>) {
        let (epoch, events, dropped) = {
            let mut inner = self.inner.write();
            if let Some(scope) = &inner.scope {
                if scope.user_id == user_id {
                    return (scope.epoch, Vec::new());
                }
            }
            let (events, dropped) = inner.clear();
            inner.last_epoch += 1;
            let epoch = inner.last_epoch;
            inner.scope = Some(CacheScope {
                user_id: user_id.to_string(),
                epoch,
            });
            self.epochs.send_replace(Some(epoch));
            (epoch, events, dropped)
        };
        debug!(user_id, epoch, "cache bound");
        self.feed.emit_batch(events);
        (epoch, dropped)
    }

    /// Clears the cache and detaches it from any session.
    ///
    /// Returns the pending writes that were abandoned.
    pub fn unbind(&self) -> Vec<PendingWrite> {
        let (events, dropped) = {
            let mut inner = self.inner.write();
            if inner.scope.take().is_none() && inner.records.is_empty() {
                return Vec::new();
            }
            self.epochs.send_replace(None);
            inner.clear()
        };
        debug!(removed = events.len(), pending = dropped.len(), "cache cleared");
        self.feed.emit_batch(events);
        dropped
    }

    /// Returns the current binding, if any.
    pub fn scope(&self) -> Option<CacheScope> {
        self.inner.read().scope.clone()
    }

    /// Returns the current epoch, or `None` while unbound.
    pub fn epoch(&self) -> Option<u64> {
        self.inner.read().scope.as_ref().map(|s| s.epoch)
    }

    /// Watches the epoch. The value changes on every bind to a new user
    /// and on unbind, so work started under an epoch can stop early.
    pub fn watch_epoch(&self) -> watch::Receiver<Option<u64>> {
        self.epochs.subscribe()
    }

    /// Resolves once `epoch` is no longer current.
    pub async fn epoch_ended(&self, epoch: u64) {
        let mut epochs = self.watch_epoch();
        // The sender lives as long as the cache, so an error cannot occur
        // while `self` is borrowed.
        let _ = epochs.wait_for(|current| *current != Some(epoch)).await;
    }

    /// Subscribes to changes.
    pub fn subscribe(&self) -> UnboundedReceiver<ChangeEvent> {
        self.feed.subscribe()
    }

    /// Returns a copy of the record for a key.
    pub fn get(&self, key: &str) -> Option<Record> {
        self.inner.read().records.get(key).cloned()
    }

    /// Returns true if a record exists for the key.
    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.read().records.contains_key(key)
    }

    /// Returns the tombstone version of a remotely deleted key.
    pub fn tombstone(&self, key: &str) -> Option<u64> {
        self.inner.read().tombstones.get(key).copied()
    }

    /// Returns the number of cached records.
    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    /// Returns true if no records are cached.
    pub fn is_empty(&self) -> bool {
        self.inner.read().records.is_empty()
    }

    /// Returns all records sorted by key.
    pub fn records(&self) -> Vec<Record> {
        let mut records: Vec<_> = self.inner.read().records.values().cloned().collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }

    /// Returns the number of writes awaiting acknowledgment.
    pub fn pending_len(&self) -> usize {
        self.inner.read().pending.len()
    }

    /// Applies a local write optimistically and queues it for delivery.
    ///
    /// The record keeps the last known remote version so stale updates are
    /// still recognised while the write is in flight.
    pub fn put_local(&self, key: &str, payload: Payload, write_id: WriteId) -> SyncResult<Enqueued> {
        let (enqueued, event) = {
            let mut inner = self.inner.write();
            if inner.scope.is_none() {
                return Err(SyncError::NotOpen);
            }
            let version = inner.local_version(key);
            inner.tombstones.remove(key);
            inner
                .records
                .insert(key.to_string(), Record::local(key, payload.clone(), version));
            let enqueued = inner.pending.enqueue_with_id(key, payload, write_id);
            (enqueued, ChangeEvent::upsert(key, Origin::Local, version))
        };
        self.feed.emit(event);
        Ok(enqueued)
    }

    /// Reconciles one remote event against local state.
    ///
    /// Returns `None` if `epoch` is no longer current.
    pub fn apply_remote(&self, epoch: u64, event: &RemoteEvent) -> Option<RemoteApplied> {
        let (applied, change) = {
            let mut inner = self.inner.write();
            if !inner.is_epoch(epoch) {
                return None;
            }
            let local_version = inner.local_version(&event.key);
            let decision = reconcile(local_version, inner.pending.get(&event.key), event);
            let mut resolved = None;
            let mut change = None;

            match decision {
                Reconciliation::Acknowledge => {
                    if let Some(pending) = inner.pending.remove(&event.key) {
                        resolved = Some((pending.write_id, WriteOutcome::Acknowledged(event.version)));
                    }
                    if let Some(record) = inner.records.get_mut(&event.key) {
                        record.version = record.version.max(event.version);
                        record.dirty = false;
                        record.unsynced = false;
                        change = Some(ChangeEvent::upsert(&event.key, record.origin, record.version));
                    }
                }
                Reconciliation::AdvanceVersion => {
                    if let Some(record) = inner.records.get_mut(&event.key) {
                        record.version = event.version;
                        change = Some(ChangeEvent::upsert(&event.key, record.origin, record.version));
                    }
                }
                Reconciliation::AcceptRemote => {
                    if let Some(pending) = inner.pending.remove(&event.key) {
                        resolved = Some((pending.write_id, WriteOutcome::Overridden(event.version)));
                    }
                    match (&event.payload, event.deleted) {
                        (Some(payload), false) => {
                            inner.tombstones.remove(&event.key);
                            inner.records.insert(
                                event.key.clone(),
                                Record::remote(&event.key, payload.clone(), event.version),
                            );
                            change = Some(ChangeEvent::upsert(&event.key, Origin::Remote, event.version));
                        }
                        _ => {
                            inner.records.remove(&event.key);
                            inner.tombstones.insert(event.key.clone(), event.version);
                            change = Some(ChangeEvent::remove(&event.key, Origin::Remote, event.version));
                        }
                    }
                }
                Reconciliation::Discard => {}
            }
            (RemoteApplied { decision, resolved }, change)
        };

        debug!(
            key = %event.key,
            version = event.version,
            decision = ?applied.decision,
            "remote event reconciled"
        );
        if let Some(change) = change {
            self.feed.emit(change);
        }
        Some(applied)
    }

    /// Takes pending writes that are ready to send.
    pub fn take_ready_writes(&self, epoch: u64, now: Instant, limit: usize) -> Vec<WriteRequest> {
        let mut inner = self.inner.write();
        if !inner.is_epoch(epoch) {
            return Vec::new();
        }
        inner.pending.take_ready(now, limit)
    }

    /// Returns the earliest time a backed-off write becomes sendable.
    pub fn next_retry_at(&self) -> Option<Instant> {
        self.inner.read().pending.next_retry_at()
    }

    /// Clears the in-flight marker of a delivered write.
    pub fn settle_write(&self, epoch: u64, key: &str, write_id: WriteId) {
        let mut inner = self.inner.write();
        if inner.is_epoch(epoch) {
            inner.pending.settle(key, write_id);
        }
    }

    /// Records a retryable delivery failure.
    ///
    /// Schedules the next attempt with `retry`'s backoff, or abandons the
    /// write once the attempt ceiling is reached. Returns the terminal
    /// outcome when the write was abandoned.
    pub fn fail_write(
        &self,
        epoch: u64,
        key: &str,
        write_id: WriteId,
        retry: &RetryConfig,
        now: Instant,
    ) -> Option<WriteOutcome> {
        let (outcome, change) = {
            let mut inner = self.inner.write();
            if !inner.is_epoch(epoch) {
                return None;
            }
            let attempts = match inner.pending.get(key) {
                Some(pending) if pending.write_id == write_id => pending.attempts + 1,
                _ => {
                    inner.pending.settle(key, write_id);
                    return None;
                }
            };
            if attempts >= retry.max_attempts {
                inner.pending.remove(key);
                (Some(WriteOutcome::Failed(attempts)), Self::mark_unsynced(&mut inner, key))
            } else {
                let retry_at = now + retry.delay_for_attempt(attempts);
                inner.pending.record_failure(key, write_id, retry_at);
                (None, None)
            }
        };
        if let Some(change) = change {
            self.feed.emit(change);
        }
        outcome
    }

    /// Abandons a write after a non-retryable failure.
    ///
    /// Returns true if `write_id` was still the current write for the key.
    pub fn abandon_write(&self, epoch: u64, key: &str, write_id: WriteId) -> bool {
        let change = {
            let mut inner = self.inner.write();
            if !inner.is_epoch(epoch) {
                return false;
            }
            match inner.pending.get(key) {
                Some(pending) if pending.write_id == write_id => {
                    inner.pending.remove(key);
                    Self::mark_unsynced(&mut inner, key)
                }
                _ => {
                    inner.pending.settle(key, write_id);
                    return false;
                }
            }
        };
        if let Some(change) = change {
            self.feed.emit(change);
        }
        true
    }

    fn mark_unsynced(inner: &mut CacheInner, key: &str) -> Option<ChangeEvent> {
        let record = inner.records.get_mut(key)?;
        record.unsynced = true;
        Some(ChangeEvent::upsert(key, record.origin, record.version))
    }

    /// Merges externally fetched items.
    ///
    /// An item is written only when the key holds no record or an external
    /// one, and the key is not tombstoned. Written records expire at
    /// `expires_at`. Returns `None` if `epoch` is no longer current.
    pub fn merge_external(
        &self,
        epoch: u64,
        items: Vec<(String, Payload)>,
        expires_at: Instant,
    ) -> Option<ExternalMerge> {
        let (merge, events) = {
            let mut inner = self.inner.write();
            if !inner.is_epoch(epoch) {
                return None;
            }
            let mut merge = ExternalMerge::default();
            let mut events = Vec::new();
            for (key, payload) in items {
                if inner.tombstones.contains_key(&key) {
                    merge.skipped += 1;
                    continue;
                }
                match inner.records.get_mut(&key) {
                    Some(existing) if existing.blocks_external() => {
                        merge.skipped += 1;
                    }
                    Some(existing) => {
                        let changed = existing.payload != payload;
                        existing.payload = payload;
                        existing.expires_at = Some(expires_at);
                        merge.refreshed += 1;
                        if changed {
                            events.push(ChangeEvent::upsert(&key, Origin::External, 0));
                        }
                    }
                    None => {
                        events.push(ChangeEvent::upsert(&key, Origin::External, 0));
                        inner
                            .records
                            .insert(key.clone(), Record::external(key, payload, expires_at));
                        merge.inserted += 1;
                    }
                }
            }
            (merge, events)
        };
        self.feed.emit_batch(events);
        Some(merge)
    }

    /// Evicts external records whose freshness window has passed.
    ///
    /// Returns the number of records removed.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let events: Vec<_> = {
            let mut inner = self.inner.write();
            let expired: Vec<String> = inner
                .records
                .values()
                .filter(|r| r.is_expired(now))
                .map(|r| r.key.clone())
                .collect();
            expired
                .into_iter()
                .filter_map(|key| inner.records.remove(&key))
                .map(|r| ChangeEvent::remove(r.key, Origin::External, r.version))
                .collect()
        };
        let removed = events.len();
        self.feed.emit_batch(events);
        removed
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use std::time::Duration;
    use tidesync_protocol::ChangeKind;
    use uuid::Uuid;

    fn bound() -> (Cache, u64) {
        let cache = Cache::new();
        let (epoch, _) = cache.bind("user-1");
        (cache, epoch)
    }

    fn put(cache: &Cache, key: &str, payload: Payload) -> WriteId {
        cache.put_local(key, payload, Uuid::new_v4()).unwrap().write_id
    }

    #[tokio::test]
    async fn epoch_ends_on_unbind_but_not_on_rebind_of_same_user() {
        let (cache, epoch) = bound();
        let epochs = cache.watch_epoch();
        assert_eq!(*epochs.borrow(), Some(epoch));

        assert_eq!(cache.bind("user-1").0, epoch);
        let pending = cache.epoch_ended(epoch);
        tokio::pin!(pending);
        let still_current = tokio::time::timeout(Duration::ZERO, pending.as_mut()).await;
        assert!(still_current.is_err());

        cache.unbind();
        pending.await;
        assert_eq!(*epochs.borrow(), None);
    }

    #[test]
    fn put_requires_binding() {
        let cache = Cache::new();
        let err = cache.put_local("a", json!(1), Uuid::new_v4()).unwrap_err();
        assert_eq!(err, SyncError::NotOpen);
    }

    #[test]
    fn put_is_visible_and_dirty() {
        let (cache, _) = bound();
        put(&cache, "a", json!(1));

        let record = cache.get("a").unwrap();
        assert_eq!(record.payload, json!(1));
        assert_eq!(record.origin, Origin::Local);
        assert!(record.dirty);
        assert_eq!(cache.pending_len(), 1);
    }

    #[test]
    fn matching_ack_clears_dirty() {
        let (cache, epoch) = bound();
        let write_id = put(&cache, "a", json!(1));

        let event = RemoteEvent::upsert("a", 5, json!(1)).with_write_id(write_id);
        let applied = cache.apply_remote(epoch, &event).unwrap();

        assert_eq!(applied.decision, Reconciliation::Acknowledge);
        assert_eq!(applied.resolved, Some((write_id, WriteOutcome::Acknowledged(5))));
        let record = cache.get("a").unwrap();
        assert_eq!(record.version, 5);
        assert!(!record.dirty);
        assert_eq!(cache.pending_len(), 0);
    }

    #[test]
    fn unrelated_stale_event_is_discarded() {
        let (cache, epoch) = bound();
        cache.apply_remote(epoch, &RemoteEvent::upsert("a", 4, json!("old")));
        put(&cache, "a", json!("mine"));

        let stale = RemoteEvent::upsert("a", 3, json!("older"));
        let applied = cache.apply_remote(epoch, &stale).unwrap();

        assert_eq!(applied.decision, Reconciliation::Discard);
        let record = cache.get("a").unwrap();
        assert_eq!(record.payload, json!("mine"));
        assert!(record.dirty);
    }

    #[test]
    fn equal_version_is_a_no_op() {
        let (cache, epoch) = bound();
        cache.apply_remote(epoch, &RemoteEvent::upsert("a", 4, json!("remote")));
        put(&cache, "a", json!("mine"));

        let tie = RemoteEvent::upsert("a", 4, json!("other"));
        let applied = cache.apply_remote(epoch, &tie).unwrap();
        assert_eq!(applied.decision, Reconciliation::Discard);
        assert_eq!(cache.get("a").unwrap().payload, json!("mine"));
    }

    #[test]
    fn newer_remote_overrides_pending_write() {
        let (cache, epoch) = bound();
        let write_id = put(&cache, "a", json!("mine"));

        let applied = cache
            .apply_remote(epoch, &RemoteEvent::upsert("a", 7, json!("theirs")))
            .unwrap();

        assert_eq!(applied.decision, Reconciliation::AcceptRemote);
        assert_eq!(applied.resolved, Some((write_id, WriteOutcome::Overridden(7))));
        let record = cache.get("a").unwrap();
        assert_eq!(record.payload, json!("theirs"));
        assert_eq!(record.origin, Origin::Remote);
        assert!(!record.dirty);
        assert_eq!(cache.pending_len(), 0);
    }

    #[test]
    fn superseded_ack_advances_version_only() {
        let (cache, epoch) = bound();
        let first = put(&cache, "a", json!(1));
        put(&cache, "a", json!(2));

        let echo = RemoteEvent::upsert("a", 3, json!(1)).with_write_id(first);
        let applied = cache.apply_remote(epoch, &echo).unwrap();

        assert_eq!(applied.decision, Reconciliation::AdvanceVersion);
        assert_eq!(applied.resolved, None);
        let record = cache.get("a").unwrap();
        assert_eq!(record.version, 3);
        assert_eq!(record.payload, json!(2));
        assert!(record.dirty);
        assert_eq!(cache.pending_len(), 1);
    }

    #[test]
    fn deletion_tombstones_key() {
        let (cache, epoch) = bound();
        cache.apply_remote(epoch, &RemoteEvent::upsert("a", 2, json!(1)));
        cache.apply_remote(epoch, &RemoteEvent::delete("a", 3));

        assert!(cache.get("a").is_none());
        assert_eq!(cache.tombstone("a"), Some(3));

        // A stale update delivered late does not resurrect the key.
        let applied = cache
            .apply_remote(epoch, &RemoteEvent::upsert("a", 2, json!(1)))
            .unwrap();
        assert_eq!(applied.decision, Reconciliation::Discard);
        assert!(cache.get("a").is_none());
    }

    #[test]
    fn stale_epoch_is_ignored() {
        let (cache, epoch) = bound();
        cache.unbind();
        cache.bind("user-2");

        assert!(cache
            .apply_remote(epoch, &RemoteEvent::upsert("a", 1, json!(1)))
            .is_none());
        assert!(cache
            .merge_external(epoch, vec![("b".into(), json!(2))], Instant::now())
            .is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn rebinding_same_user_keeps_data() {
        let (cache, epoch) = bound();
        put(&cache, "a", json!(1));
        let (again, dropped) = cache.bind("user-1");
        assert_eq!(again, epoch);
        assert!(dropped.is_empty());
        assert!(cache.contains_key("a"));

        let (other, dropped) = cache.bind("user-2");
        assert!(other > epoch);
        assert_eq!(dropped.len(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn unbind_clears_and_notifies() {
        let (cache, epoch) = bound();
        cache.apply_remote(epoch, &RemoteEvent::upsert("a", 1, json!(1)));
        put(&cache, "b", json!(2));
        let mut rx = cache.subscribe();

        let dropped = cache.unbind();
        assert_eq!(dropped.len(), 1);
        assert!(cache.is_empty());
        assert_eq!(cache.epoch(), None);

        let first = rx.try_recv().unwrap();
        assert_eq!(first.kind, ChangeKind::Remove);
        assert_eq!(first.key, "a");
        assert_eq!(rx.try_recv().unwrap().key, "b");
    }

    #[test]
    fn external_never_overwrites_local_or_remote() {
        let (cache, epoch) = bound();
        put(&cache, "local", json!("mine"));
        cache.apply_remote(epoch, &RemoteEvent::upsert("remote", 2, json!("theirs")));
        cache.apply_remote(epoch, &RemoteEvent::delete("gone", 3));

        let expires = Instant::now() + Duration::from_secs(60);
        let merge = cache
            .merge_external(
                epoch,
                vec![
                    ("local".into(), json!("x")),
                    ("remote".into(), json!("x")),
                    ("gone".into(), json!("x")),
                    ("fresh".into(), json!("x")),
                ],
                expires,
            )
            .unwrap();

        assert_eq!(merge.inserted, 1);
        assert_eq!(merge.skipped, 3);
        assert_eq!(cache.get("local").unwrap().payload, json!("mine"));
        assert_eq!(cache.get("remote").unwrap().payload, json!("theirs"));
        assert!(cache.get("gone").is_none());

        let fresh = cache.get("fresh").unwrap();
        assert_eq!(fresh.origin, Origin::External);
        assert_eq!(fresh.version, 0);
        assert_eq!(fresh.expires_at, Some(expires));
    }

    #[test]
    fn acknowledged_local_record_still_blocks_external() {
        let (cache, epoch) = bound();
        let write_id = put(&cache, "a", json!("mine"));
        cache.apply_remote(epoch, &RemoteEvent::upsert("a", 1, json!("mine")).with_write_id(write_id));

        let merge = cache
            .merge_external(epoch, vec![("a".into(), json!("x"))], Instant::now())
            .unwrap();
        assert_eq!(merge.skipped, 1);
        assert_eq!(cache.get("a").unwrap().payload, json!("mine"));
    }

    #[test]
    fn external_is_refreshed_and_overridden_by_remote() {
        let (cache, epoch) = bound();
        let now = Instant::now();
        cache.merge_external(epoch, vec![("b".into(), json!("X"))], now);
        let merge = cache
            .merge_external(epoch, vec![("b".into(), json!("Y"))], now + Duration::from_secs(5))
            .unwrap();
        assert_eq!(merge.refreshed, 1);
        assert_eq!(cache.get("b").unwrap().payload, json!("Y"));

        cache.apply_remote(epoch, &RemoteEvent::upsert("b", 2, json!("R")));
        let record = cache.get("b").unwrap();
        assert_eq!(record.origin, Origin::Remote);
        assert_eq!(record.payload, json!("R"));
        assert_eq!(record.expires_at, None);
    }

    #[test]
    fn sweep_evicts_only_expired_external() {
        let (cache, epoch) = bound();
        let now = Instant::now();
        cache.merge_external(epoch, vec![("old".into(), json!(1))], now);
        cache.merge_external(epoch, vec![("new".into(), json!(2))], now + Duration::from_secs(60));
        put(&cache, "mine", json!(3));

        assert_eq!(cache.sweep_expired(now + Duration::from_secs(1)), 1);
        assert!(cache.get("old").is_none());
        assert!(cache.get("new").is_some());
        assert!(cache.get("mine").is_some());
    }

    #[test]
    fn write_abandoned_at_attempt_ceiling() {
        let (cache, epoch) = bound();
        let retry = RetryConfig::new(2).with_jitter(false);
        let now = Instant::now();
        let write_id = put(&cache, "a", json!(1));

        cache.take_ready_writes(epoch, now, 10);
        assert_eq!(cache.fail_write(epoch, "a", write_id, &retry, now), None);
        assert_eq!(cache.next_retry_at(), Some(now + Duration::from_millis(100)));

        let later = now + Duration::from_secs(1);
        assert_eq!(cache.take_ready_writes(epoch, later, 10).len(), 1);
        assert_eq!(
            cache.fail_write(epoch, "a", write_id, &retry, later),
            Some(WriteOutcome::Failed(2))
        );

        let record = cache.get("a").unwrap();
        assert!(record.dirty);
        assert!(record.unsynced);
        assert_eq!(cache.pending_len(), 0);
    }

    #[test]
    fn abandon_ignores_replaced_write() {
        let (cache, epoch) = bound();
        let first = put(&cache, "a", json!(1));
        cache.take_ready_writes(epoch, Instant::now(), 10);
        let second = put(&cache, "a", json!(2));

        assert!(!cache.abandon_write(epoch, "a", first));
        assert_eq!(cache.pending_len(), 1);
        assert!(cache.abandon_write(epoch, "a", second));
        assert!(cache.get("a").unwrap().unsynced);
    }

    #[derive(Debug, Clone)]
    struct Step {
        key: u8,
        deleted: bool,
        value: i64,
    }

    fn events_from(steps: &[Step]) -> Vec<RemoteEvent> {
        steps
            .iter()
            .enumerate()
            .map(|(i, step)| {
                let key = format!("k{}", step.key);
                let version = i as u64 + 1;
                if step.deleted {
                    RemoteEvent::delete(key, version)
                } else {
                    RemoteEvent::upsert(key, version, json!(step.value))
                }
            })
            .collect()
    }

    fn final_state(events: &[RemoteEvent]) -> (Vec<Record>, Vec<Option<u64>>) {
        let (cache, epoch) = bound();
        for event in events {
            cache.apply_remote(epoch, event);
        }
        let tombstones = (0..4).map(|k| cache.tombstone(&format!("k{k}"))).collect();
        (cache.records(), tombstones)
    }

    proptest! {
        #[test]
        fn delivery_order_does_not_matter(
            (ordered, shuffled) in prop::collection::vec(
                (0u8..4, any::<bool>(), any::<i64>())
                    .prop_map(|(key, deleted, value)| Step { key, deleted, value }),
                1..24,
            )
            .prop_map(|steps| events_from(&steps))
            .prop_flat_map(|events| (Just(events.clone()), Just(events).prop_shuffle()))
        ) {
            prop_assert_eq!(final_state(&ordered), final_state(&shuffled));
        }
    }
}
