//! In-process reference remote store.

use crate::error::{SyncError, SyncResult};
use crate::store::{RemoteStore, Subscription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tidesync_protocol::{Payload, RemoteEvent, WriteAck, WriteId, WriteRequest};
use tidesync_session::{Session, TokenKind, TokenVerifier};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredRecord {
    version: u64,
    payload: Option<Payload>,
    /// Client write that produced this version.
    write_id: Option<WriteId>,
}

impl StoredRecord {
    fn event(&self, key: &str) -> RemoteEvent {
        let event = match &self.payload {
            Some(payload) => RemoteEvent::upsert(key, self.version, payload.clone()),
            None => RemoteEvent::delete(key, self.version),
        };
        match self.write_id {
            Some(write_id) => event.with_write_id(write_id),
            None => event,
        }
    }
}

#[derive(Default)]
struct Partition {
    records: BTreeMap<String, StoredRecord>,
    subscribers: Vec<UnboundedSender<RemoteEvent>>,
}

impl Partition {
    fn broadcast(&mut self, event: &RemoteEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

struct StoreState {
    next_version: u64,
    partitions: HashMap<String, Partition>,
}

/// A remote store kept in memory, partitioned by user.
///
/// Versions come from one global counter, so every write receives a
/// version strictly greater than any before it. Writes are broadcast to
/// every subscriber of the user's partition, echoing the writer's
/// `write_id`. The snapshot sent on subscribe echoes it too, and a write
/// whose `write_id` already produced the current version is acknowledged
/// again instead of being committed twice.
///
/// Test hooks simulate another device (`remote_put`, `remote_delete`),
/// arbitrary delivery (`inject`), network loss (`set_online`) and flaky
/// writes (`fail_next_writes`).
pub struct MemoryRemoteStore {
    verifier: Option<TokenVerifier>,
    state: Mutex<StoreState>,
    online: AtomicBool,
    failing_writes: AtomicU32,
    writes: AtomicU64,
}

impl MemoryRemoteStore {
    /// Creates a store that accepts any unexpired session.
    pub fn new() -> Self {
        Self {
            verifier: None,
            state: Mutex::new(StoreState {
                next_version: 1,
                partitions: HashMap::new(),
            }),
            online: AtomicBool::new(true),
            failing_writes: AtomicU32::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Requires identity tokens signed by `verifier`.
    pub fn with_verifier(mut self, verifier: TokenVerifier) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Sets the version the next write receives.
    pub fn set_next_version(&self, version: u64) {
        let mut state = self.state.lock();
        state.next_version = state.next_version.max(version);
    }

    /// Switches connectivity.
    ///
    /// Going offline also drops every open subscription.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        if !online {
            let mut state = self.state.lock();
            for partition in state.partitions.values_mut() {
                partition.subscribers.clear();
            }
        }
    }

    /// Makes the next `count` writes fail as unreachable.
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Returns the number of writes accepted through `write`.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Returns the number of open subscriptions for a user.
    pub fn subscriber_count(&self, user_id: &str) -> usize {
        let mut state = self.state.lock();
        state.partitions.get_mut(user_id).map_or(0, |p| {
            p.subscribers.retain(|tx| !tx.is_closed());
            p.subscribers.len()
        })
    }

    /// Returns the stored version and payload of a key.
    ///
    /// Deleted keys report a `None` payload.
    pub fn record(&self, user_id: &str, key: &str) -> Option<(u64, Option<Payload>)> {
        let state = self.state.lock();
        let stored = state.partitions.get(user_id)?.records.get(key)?;
        Some((stored.version, stored.payload.clone()))
    }

    /// Writes a record as another device would. Returns the new version.
    pub fn remote_put(&self, user_id: &str, key: &str, payload: Payload) -> u64 {
        self.commit(user_id, key, Some(payload), None)
    }

    /// Deletes a record as another device would. Returns the tombstone version.
    pub fn remote_delete(&self, user_id: &str, key: &str) -> u64 {
        self.commit(user_id, key, None, None)
    }

    /// Delivers an event to subscribers without storing it.
    pub fn inject(&self, user_id: &str, event: RemoteEvent) {
        let mut state = self.state.lock();
        if let Some(partition) = state.partitions.get_mut(user_id) {
            partition.broadcast(&event);
        }
    }

    fn commit(
        &self,
        user_id: &str,
        key: &str,
        payload: Option<Payload>,
        write_id: Option<WriteId>,
    ) -> u64 {
        let mut state = self.state.lock();
        let version = state.next_version;
        state.next_version += 1;

        let partition = state.partitions.entry(user_id.to_string()).or_default();
        let stored = StoredRecord {
            version,
            payload,
            write_id,
        };
        let event = stored.event(key);
        partition.records.insert(key.to_string(), stored);
        partition.broadcast(&event);
        debug!(user_id, key, version, "remote commit");
        version
    }

    /// Returns the version `request` already produced, if it is current.
    fn applied_version(&self, user_id: &str, request: &WriteRequest) -> Option<u64> {
        let state = self.state.lock();
        let stored = state.partitions.get(user_id)?.records.get(&request.key)?;
        (stored.write_id == Some(request.write_id)).then_some(stored.version)
    }

    fn check_online(&self) -> SyncResult<()> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncError::unreachable("remote store offline"))
        }
    }

    fn authorize(&self, session: &Session) -> SyncResult<String> {
        if session.is_expired() {
            return Err(SyncError::unauthorized("session expired"));
        }
        if let Some(verifier) = &self.verifier {
            let claims = verifier
                .verify(session.id_token(), TokenKind::Id)
                .map_err(|e| SyncError::unauthorized(e.to_string()))?;
            if claims.user_id != session.user_id() {
                return Err(SyncError::unauthorized("token issued to another user"));
            }
        }
        Ok(session.user_id().to_string())
    }
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn subscribe(&self, session: &Session) -> SyncResult<Subscription> {
        self.check_online()?;
        let user_id = self.authorize(session)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        let partition = state.partitions.entry(user_id).or_default();
        for (key, stored) in &partition.records {
            // The receiver is still in scope, so this cannot fail.
            let _ = tx.send(stored.event(key));
        }
        partition.subscribers.push(tx);
        Ok(Subscription::new(rx))
    }

    async fn write(&self, session: &Session, request: &WriteRequest) -> SyncResult<WriteAck> {
        self.check_online()?;
        let user_id = self.authorize(session)?;

        if self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SyncError::unreachable("injected write failure"));
        }

        if let Some(version) = self.applied_version(&user_id, request) {
            debug!(key = %request.key, version, "duplicate write acknowledged");
            return Ok(WriteAck {
                key: request.key.clone(),
                version,
                write_id: request.write_id,
            });
        }

        let version = self.commit(
            &user_id,
            &request.key,
            Some(request.payload.clone()),
            Some(request.write_id),
        );
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(WriteAck {
            key: request.key.clone(),
            version,
            write_id: request.write_id,
        })
    }
}
