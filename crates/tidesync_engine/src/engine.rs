//! Remote sync engine.

use crate::cache::Cache;
use crate::config::EngineConfig;
use crate::error::{SyncError, SyncResult};
use crate::store::{RemoteStore, Subscription};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tidesync_protocol::{ChangeEvent, Payload, Record, RemoteEvent, WriteId, WriteOutcome, WriteRequest};
use tidesync_session::{Session, SessionObserver};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The connection state of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No session is bound.
    Closed,
    /// Establishing the subscription.
    Connecting,
    /// Subscription established; remote updates are flowing.
    Live,
    /// Bound to a session but the remote is unreachable.
    ///
    /// Reads and writes keep working against the cache. Pending writes are
    /// held until the engine is live again. Calling `open` again resumes.
    Offline,
}

impl EngineState {
    /// Returns true if a session is bound.
    pub fn is_open(&self) -> bool {
        !matches!(self, EngineState::Closed)
    }
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    /// Remote events that changed cached state.
    pub events_applied: u64,
    /// Remote events discarded as stale.
    pub events_discarded: u64,
    /// Write deliveries attempted.
    pub writes_sent: u64,
    /// Writes acknowledged by the remote.
    pub writes_acknowledged: u64,
    /// Delivery attempts that failed and were rescheduled.
    pub write_retries: u64,
    /// Writes given up on.
    pub writes_failed: u64,
    /// Failed deliveries not counted because the connection was down.
    pub writes_held: u64,
    /// Subscription attempts after the first.
    pub reconnects: u64,
    /// When the last remote event was applied.
    pub last_event_time: Option<std::time::Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Handle to the outcome of one `put`.
///
/// Dropping the handle does not cancel the write.
#[derive(Debug)]
pub struct WriteHandle {
    key: String,
    write_id: WriteId,
    outcome: oneshot::Receiver<SyncResult<u64>>,
}

impl WriteHandle {
    /// Returns the key written.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the write identifier sent to the remote.
    pub fn write_id(&self) -> WriteId {
        self.write_id
    }

    /// Waits until the write settles.
    ///
    /// Resolves to the version the remote assigned, or to the reason the
    /// write will never be acknowledged.
    pub async fn outcome(self) -> SyncResult<u64> {
        self.outcome.await.unwrap_or(Err(SyncError::Cancelled))
    }
}

/// Tasks serving one cache binding.
struct Run {
    epoch: u64,
    pusher: JoinHandle<()>,
    listener: Option<JoinHandle<()>>,
}

impl Run {
    fn is_live(&self) -> bool {
        self.listener.as_ref().is_some_and(|l| !l.is_finished())
    }

    fn abort(self) {
        self.pusher.abort();
        if let Some(listener) = self.listener {
            listener.abort();
        }
    }
}

struct Inner<S> {
    config: EngineConfig,
    store: S,
    cache: Arc<Cache>,
    session: RwLock<Option<Arc<Session>>>,
    state: watch::Sender<EngineState>,
    stats: RwLock<EngineStats>,
    waiters: Mutex<HashMap<WriteId, oneshot::Sender<SyncResult<u64>>>>,
    wake: Notify,
    run: Mutex<Option<Run>>,
    /// Bumped by `close`; every task and in-flight `open` stops when it changes.
    shutdown: watch::Sender<u64>,
    /// Serializes `open` and `close`.
    lifecycle: tokio::sync::Mutex<()>,
}

/// Keeps the cache consistent with a remote store for the active session.
///
/// Local writes are applied to the cache immediately and delivered in the
/// background with at-least-once semantics. Remote updates arrive over a
/// subscription and are reconciled by version, so duplicates and
/// reordering are harmless.
///
/// The engine is cheap to clone; clones share the same state.
pub struct SyncEngine<S: RemoteStore + 'static> {
    inner: Arc<Inner<S>>,
}

impl<S: RemoteStore + 'static> Clone for SyncEngine<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: RemoteStore + 'static> SyncEngine<S> {
    /// Creates a closed engine.
    pub fn new(config: EngineConfig, store: S) -> Self {
        let (state, _) = watch::channel(EngineState::Closed);
        let (shutdown, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                cache: Arc::new(Cache::new()),
                session: RwLock::new(None),
                state,
                stats: RwLock::new(EngineStats::default()),
                waiters: Mutex::new(HashMap::new()),
                wake: Notify::new(),
                run: Mutex::new(None),
                shutdown,
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Returns the remote store.
    pub fn store(&self) -> &S {
        &self.inner.store
    }

    /// Returns the shared cache.
    pub fn cache(&self) -> Arc<Cache> {
        Arc::clone(&self.inner.cache)
    }

    /// Gets the current state.
    pub fn state(&self) -> EngineState {
        *self.inner.state.borrow()
    }

    /// Watches state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<EngineState> {
        self.inner.state.subscribe()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> EngineStats {
        self.inner.stats.read().clone()
    }

    /// Returns the session the engine is bound to.
    pub fn session(&self) -> Option<Arc<Session>> {
        self.inner.session.read().clone()
    }

    /// Subscribes to cache changes.
    pub fn subscribe(&self) -> UnboundedReceiver<ChangeEvent> {
        self.inner.cache.subscribe()
    }

    /// Binds the cache to `session` and establishes the subscription.
    ///
    /// Opening the session that is already live is a no-op. Opening a
    /// session for another user discards the previous user's data first.
    ///
    /// # Errors
    ///
    /// - `Unauthorized` if the session is expired or rejected; the engine
    ///   is closed
    /// - `Unreachable` once connection retries are exhausted; the engine
    ///   stays bound in the `Offline` state
    /// - `Cancelled` if `close` ran meanwhile
    pub async fn open(&self, session: Arc<Session>) -> SyncResult<()> {
        let result = self.inner.open(session).await;
        match result {
            Err(SyncError::Unauthorized(message)) => {
                warn!(%message, "session rejected, closing");
                self.inner.record_error(&SyncError::Unauthorized(message.clone()));
                self.inner.close().await;
                Err(SyncError::Unauthorized(message))
            }
            Err(SyncError::Cancelled) => Err(SyncError::Cancelled),
            Err(e) => {
                warn!(error = %e, "remote unreachable, continuing offline");
                self.inner.record_error(&e);
                self.inner.set_state(EngineState::Offline);
                Err(e)
            }
            Ok(()) => Ok(()),
        }
    }

    /// Writes a record.
    ///
    /// The cache reflects the write before this returns; delivery happens
    /// in the background. Only fails with `NotOpen` when no session is bound.
    pub fn put(&self, key: &str, payload: Payload) -> SyncResult<WriteHandle> {
        let write_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.inner.waiters.lock().insert(write_id, tx);

        let enqueued = match self.inner.cache.put_local(key, payload, write_id) {
            Ok(enqueued) => enqueued,
            Err(e) => {
                self.inner.waiters.lock().remove(&write_id);
                return Err(e);
            }
        };
        if let Some(replaced) = enqueued.replaced {
            self.inner.resolve(
                replaced,
                Err(SyncError::Superseded {
                    key: key.to_string(),
                }),
            );
        }
        debug!(key, %write_id, "local write queued");
        self.inner.wake.notify_one();

        Ok(WriteHandle {
            key: key.to_string(),
            write_id,
            outcome: rx,
        })
    }

    /// Reads a record from the cache. Never performs I/O.
    pub fn get(&self, key: &str) -> Option<Record> {
        self.inner.cache.get(key)
    }

    /// Stops all background work, cancels pending writes and clears the cache.
    ///
    /// Idempotent, and safe to call when `open` never succeeded.
    pub async fn close(&self) {
        self.inner.close().await;
    }
}

impl<S: RemoteStore + 'static> Inner<S> {
    fn set_state(&self, state: EngineState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            let from = *current;
            info!(?from, to = ?state, "sync engine state changed");
            *current = state;
            true
        });
    }

    fn record_error(&self, error: &SyncError) {
        self.stats.write().last_error = Some(error.to_string());
    }

    fn resolve(&self, write_id: WriteId, result: SyncResult<u64>) {
        if let Some(tx) = self.waiters.lock().remove(&write_id) {
            // The caller may have dropped the handle.
            let _ = tx.send(result);
        }
    }

    async fn open(self: &Arc<Self>, session: Arc<Session>) -> SyncResult<()> {
        let _guard = self.lifecycle.lock().await;
        let mut shutdown = self.shutdown.subscribe();

        if session.is_expired() {
            return Err(SyncError::unauthorized("session expired"));
        }

        *self.session.write() = Some(Arc::clone(&session));
        let (epoch, dropped) = self.cache.bind(session.user_id());
        for pending in dropped {
            self.resolve(pending.write_id, Err(SyncError::Cancelled));
        }

        {
            let mut run = self.run.lock();
            match run.take() {
                Some(current) if current.epoch == epoch => {
                    if current.is_live() {
                        *run = Some(current);
                        return Ok(());
                    }
                    *run = Some(current);
                }
                stale => {
                    if let Some(stale) = stale {
                        stale.abort();
                    }
                    let pusher = tokio::spawn(Arc::clone(self).push_loop(epoch, self.shutdown.subscribe()));
                    *run = Some(Run {
                        epoch,
                        pusher,
                        listener: None,
                    });
                }
            }
        }
        self.wake.notify_one();

        let subscription = self.connect(&mut shutdown).await?;
        let listener = tokio::spawn(Arc::clone(self).listen(epoch, subscription, shutdown));
        if let Some(run) = self.run.lock().as_mut().filter(|r| r.epoch == epoch) {
            run.listener = Some(listener);
        }
        self.set_state(EngineState::Live);
        info!(user_id = session.user_id(), epoch, "subscription live");
        Ok(())
    }

    /// Opens a subscription, retrying transient failures with backoff.
    async fn connect(&self, shutdown: &mut watch::Receiver<u64>) -> SyncResult<Subscription> {
        let retry = &self.config.connect_retry;
        let mut last_error = SyncError::unreachable("no connection attempt made");

        for attempt in 0..retry.max_attempts {
            if attempt > 0 {
                let delay = retry.delay_for_attempt(attempt);
                debug!(attempt, ?delay, "retrying subscription");
                self.stats.write().reconnects += 1;
                tokio::select! {
                    _ = shutdown.changed() => return Err(SyncError::Cancelled),
                    _ = sleep(delay) => {}
                }
            }

            let session = self.session.read().clone();
            let Some(session) = session else {
                return Err(SyncError::Cancelled);
            };
            self.set_state(EngineState::Connecting);

            let result = tokio::select! {
                _ = shutdown.changed() => return Err(SyncError::Cancelled),
                result = timeout(self.config.request_timeout, self.store.subscribe(&session)) => result,
            };
            match result {
                Ok(Ok(subscription)) => return Ok(subscription),
                Ok(Err(e)) if e.is_retryable() => {
                    debug!(attempt, error = %e, "subscription attempt failed");
                    last_error = e;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    debug!(attempt, "subscription attempt timed out");
                    last_error = SyncError::unreachable("subscription timed out");
                }
            }
        }

        Err(last_error)
    }

    async fn listen(
        self: Arc<Self>,
        epoch: u64,
        mut subscription: Subscription,
        mut shutdown: watch::Receiver<u64>,
    ) {
        loop {
            let event = tokio::select! {
                _ = shutdown.changed() => break,
                event = subscription.next() => event,
            };
            match event {
                Some(event) => self.apply_event(epoch, &event),
                None => {
                    if self.cache.epoch() != Some(epoch) {
                        break;
                    }
                    warn!("subscription ended, reconnecting");
                    match self.connect(&mut shutdown).await {
                        Ok(next) => {
                            subscription = next;
                            self.set_state(EngineState::Live);
                            info!(epoch, "subscription re-established");
                        }
                        Err(SyncError::Cancelled) => break,
                        Err(e) => {
                            warn!(error = %e, "reconnect failed, continuing offline");
                            self.record_error(&e);
                            self.set_state(EngineState::Offline);
                            break;
                        }
                    }
                }
            }
        }
        debug!(epoch, "listener stopped");
    }

    fn apply_event(&self, epoch: u64, event: &RemoteEvent) {
        let Some(applied) = self.cache.apply_remote(epoch, event) else {
            return;
        };
        {
            let mut stats = self.stats.write();
            if applied.decision.changes_state() {
                stats.events_applied += 1;
            } else {
                stats.events_discarded += 1;
            }
            stats.last_event_time = Some(std::time::Instant::now());
        }

        match applied.resolved {
            Some((write_id, WriteOutcome::Acknowledged(version))) => {
                self.stats.write().writes_acknowledged += 1;
                debug!(key = %event.key, version, "write acknowledged");
                self.resolve(write_id, Ok(version));
            }
            Some((write_id, WriteOutcome::Overridden(version))) => {
                info!(key = %event.key, version, "local write overridden by remote");
                self.resolve(
                    write_id,
                    Err(SyncError::Overridden {
                        key: event.key.clone(),
                        version,
                    }),
                );
            }
            _ => {}
        }
    }

    /// Delivers pending writes while the subscription is live.
    ///
    /// Writes are held, not attempted, while the engine is `Offline` or
    /// `Connecting`, and delivery resumes on the next transition to `Live`.
    async fn push_loop(self: Arc<Self>, epoch: u64, mut shutdown: watch::Receiver<u64>) {
        let mut state = self.state.subscribe();
        loop {
            if *state.borrow_and_update() != EngineState::Live {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = state.changed() => {}
                }
                if self.cache.epoch() != Some(epoch) {
                    break;
                }
                continue;
            }

            let now = Instant::now().into_std();
            let batch = self
                .cache
                .take_ready_writes(epoch, now, self.config.write_batch_size);
            let sent = !batch.is_empty();
            for request in batch {
                if !self.deliver(epoch, request, &mut shutdown).await {
                    return;
                }
            }
            if self.cache.epoch() != Some(epoch) {
                break;
            }
            if sent {
                // Settling may have released a coalesced write.
                continue;
            }

            let retry_at = self.cache.next_retry_at().map(Instant::from_std);
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = state.changed() => {}
                _ = self.wake.notified() => {}
                _ = sleep_until_some(retry_at) => {}
            }
        }
        debug!(epoch, "pusher stopped");
    }

    /// Sends one write. Returns false if the engine is shutting down.
    async fn deliver(
        &self,
        epoch: u64,
        request: WriteRequest,
        shutdown: &mut watch::Receiver<u64>,
    ) -> bool {
        let session = self.session.read().clone();
        let Some(session) = session else {
            self.cache.settle_write(epoch, &request.key, request.write_id);
            return false;
        };
        self.stats.write().writes_sent += 1;

        let result = tokio::select! {
            _ = shutdown.changed() => return false,
            result = timeout(self.config.request_timeout, self.store.write(&session, &request)) => {
                result.unwrap_or(Err(SyncError::Timeout))
            }
        };

        match result {
            Ok(ack) => {
                self.apply_event(epoch, &RemoteEvent::from_ack(&ack, &request));
                self.cache.settle_write(epoch, &request.key, request.write_id);
            }
            Err(e) if e.is_retryable() && *self.state.borrow() != EngineState::Live => {
                // The connection dropped under this write; resend it once
                // live again without spending an attempt.
                debug!(key = %request.key, error = %e, "write held until reconnected");
                self.stats.write().writes_held += 1;
                self.cache.settle_write(epoch, &request.key, request.write_id);
            }
            Err(e) if e.is_retryable() => {
                self.stats.write().write_retries += 1;
                debug!(key = %request.key, error = %e, "write attempt failed");
                let now = Instant::now().into_std();
                let retry = &self.config.write_retry;
                if let Some(WriteOutcome::Failed(attempts)) =
                    self.cache.fail_write(epoch, &request.key, request.write_id, retry, now)
                {
                    warn!(key = %request.key, attempts, "write abandoned");
                    let error = SyncError::WriteFailed {
                        key: request.key.clone(),
                        attempts,
                    };
                    self.record_error(&error);
                    self.stats.write().writes_failed += 1;
                    self.resolve(request.write_id, Err(error));
                }
            }
            Err(e) => {
                warn!(key = %request.key, error = %e, "write rejected");
                self.record_error(&e);
                if self.cache.abandon_write(epoch, &request.key, request.write_id) {
                    self.stats.write().writes_failed += 1;
                    self.resolve(request.write_id, Err(e));
                }
            }
        }
        true
    }

    async fn close(&self) {
        // Once to stop an `open` waiting on the network, once more for any
        // tasks an `open` spawned before we got the lock.
        self.shutdown.send_modify(|n| *n += 1);
        let _guard = self.lifecycle.lock().await;
        self.shutdown.send_modify(|n| *n += 1);

        let run = self.run.lock().take();
        if let Some(run) = run {
            let _ = run.pusher.await;
            if let Some(listener) = run.listener {
                let _ = listener.await;
            }
        }

        let dropped = self.cache.unbind();
        let waiters: Vec<_> = self.waiters.lock().drain().collect();
        for (_, tx) in waiters {
            let _ = tx.send(Err(SyncError::Cancelled));
        }
        *self.session.write() = None;

        if *self.state.borrow() != EngineState::Closed {
            info!(abandoned_writes = dropped.len(), "sync engine closed");
        }
        self.set_state(EngineState::Closed);
    }

    fn replace_session(&self, session: Arc<Session>) {
        let mut current = self.session.write();
        if current
            .as_ref()
            .is_some_and(|s| s.user_id() == session.user_id())
        {
            debug!(generation = session.generation(), "sync engine using refreshed session");
            *current = Some(session);
        }
    }
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl<S: RemoteStore + 'static> SessionObserver for SyncEngine<S> {
    async fn session_refreshed(&self, session: Arc<Session>) {
        self.inner.replace_session(session);
    }

    async fn session_ended(&self) {
        self.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::memory::MemoryRemoteStore;
    use serde_json::json;
    use std::time::{Duration, SystemTime};

    fn session(user: &str) -> Arc<Session> {
        Arc::new(Session::new(
            user,
            "id",
            "refresh",
            SystemTime::now() + Duration::from_secs(600),
            0,
        ))
    }

    fn config() -> EngineConfig {
        let retry = RetryConfig::new(3)
            .with_initial_delay(Duration::from_millis(10))
            .with_jitter(false);
        EngineConfig::new()
            .with_connect_retry(retry.clone())
            .with_write_retry(retry)
    }

    #[tokio::test]
    async fn put_before_open_fails() {
        let engine = SyncEngine::new(config(), MemoryRemoteStore::new());
        let err = engine.put("a", json!(1)).unwrap_err();
        assert_eq!(err, SyncError::NotOpen);
        assert_eq!(engine.state(), EngineState::Closed);
    }

    #[tokio::test]
    async fn open_goes_live() {
        let engine = SyncEngine::new(config(), MemoryRemoteStore::new());
        engine.open(session("u1")).await.unwrap();
        assert_eq!(engine.state(), EngineState::Live);
        assert_eq!(engine.store().subscriber_count("u1"), 1);

        // Opening again is a no-op.
        engine.open(session("u1")).await.unwrap();
        assert_eq!(engine.store().subscriber_count("u1"), 1);
        engine.close().await;
    }

    #[tokio::test]
    async fn expired_session_is_unauthorized() {
        let engine = SyncEngine::new(config(), MemoryRemoteStore::new());
        let expired = Arc::new(Session::new(
            "u1",
            "id",
            "refresh",
            SystemTime::now() - Duration::from_secs(1),
            0,
        ));
        let err = engine.open(expired).await.unwrap_err();
        assert!(matches!(err, SyncError::Unauthorized(_)));
        assert_eq!(engine.state(), EngineState::Closed);
        assert!(engine.cache().scope().is_none());
    }

    #[tokio::test]
    async fn put_is_acknowledged() {
        let engine = SyncEngine::new(config(), MemoryRemoteStore::new());
        engine.open(session("u1")).await.unwrap();

        let handle = engine.put("a", json!(1)).unwrap();
        assert!(engine.get("a").unwrap().dirty);

        let version = handle.outcome().await.unwrap();
        let record = engine.get("a").unwrap();
        assert_eq!(record.version, version);
        assert!(!record.dirty);
        assert_eq!(engine.stats().writes_acknowledged, 1);
        engine.close().await;
    }

    #[tokio::test]
    async fn second_put_supersedes_first() {
        let engine = SyncEngine::new(config(), MemoryRemoteStore::new());
        engine.open(session("u1")).await.unwrap();

        let first = engine.put("a", json!(1)).unwrap();
        let second = engine.put("a", json!(2)).unwrap();

        assert_eq!(
            first.outcome().await,
            Err(SyncError::Superseded { key: "a".into() })
        );
        second.outcome().await.unwrap();
        assert_eq!(engine.get("a").unwrap().payload, json!(2));
        engine.close().await;
    }

    #[tokio::test]
    async fn close_cancels_pending_writes() {
        let store = MemoryRemoteStore::new();
        store.set_online(false);
        let engine = SyncEngine::new(config(), store);
        let _ = engine.open(session("u1")).await;

        let handle = engine.put("a", json!(1)).unwrap();
        engine.close().await;

        assert_eq!(handle.outcome().await, Err(SyncError::Cancelled));
        assert!(engine.get("a").is_none());
        assert_eq!(engine.state(), EngineState::Closed);

        // Idempotent.
        engine.close().await;
    }
}
