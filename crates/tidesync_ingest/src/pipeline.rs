//! Ingestion cycles and their scheduler.

use crate::config::IngestConfig;
use crate::error::{IngestError, IngestResult};
use crate::parse::{parse, Parsed, RawItem};
use crate::source::ExternalSource;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tidesync_engine::{Cache, ExternalMerge};
use tidesync_session::{AuthProvider, Session, SessionManager};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Read access to the active session.
pub trait CurrentSession: Send + Sync {
    /// Returns the active session, if any. Must not block on I/O.
    fn current_session(&self) -> Option<Arc<Session>>;
}

impl<P: AuthProvider> CurrentSession for SessionManager<P> {
    fn current_session(&self) -> Option<Arc<Session>> {
        SessionManager::current_session(self)
    }
}

/// Outcome of one ingestion cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Items parsed from the response.
    pub fetched: usize,
    /// Parsed items rejected by the configured filter.
    pub filtered: usize,
    /// Items skipped as malformed.
    pub parse_failures: usize,
    /// Merge counts.
    pub merge: ExternalMerge,
    /// Stale external records evicted before the fetch.
    pub expired: usize,
    /// Fetch attempts made.
    pub attempts: u32,
    /// True if the session changed during the fetch and the items were dropped.
    pub discarded: bool,
}

/// Ingestion counters.
#[derive(Debug, Clone, Default)]
pub struct IngestStats {
    /// Cycles that merged their items.
    pub cycles_completed: u64,
    /// Cycles that ended in an error.
    pub cycles_failed: u64,
    /// Scheduled ticks that did not start a cycle.
    pub cycles_skipped: u64,
    /// Items written into the cache.
    pub items_merged: u64,
    /// Malformed items across all cycles.
    pub parse_failures: u64,
    /// When the last cycle finished.
    pub last_cycle_time: Option<SystemTime>,
    /// Last cycle error.
    pub last_error: Option<String>,
}

type CycleResult = IngestResult<CycleReport>;

/// Fetches external data and merges it into the cache.
///
/// Cycles are single-flight: a `run_cycle` that starts while another is
/// running waits for that cycle and returns its result.
pub struct IngestPipeline<E: ExternalSource + 'static> {
    inner: Arc<Inner<E>>,
}

impl<E: ExternalSource + 'static> Clone for IngestPipeline<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<E> {
    config: IngestConfig,
    source: E,
    cache: Arc<Cache>,
    sessions: Arc<dyn CurrentSession>,
    inflight: Mutex<Option<broadcast::Sender<CycleResult>>>,
    stats: RwLock<IngestStats>,
}

impl<E: ExternalSource + 'static> IngestPipeline<E> {
    /// Creates a pipeline writing into `cache` on behalf of `sessions`.
    pub fn new(
        config: IngestConfig,
        source: E,
        cache: Arc<Cache>,
        sessions: Arc<dyn CurrentSession>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                source,
                cache,
                sessions,
                inflight: Mutex::new(None),
                stats: RwLock::new(IngestStats::default()),
            }),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &IngestConfig {
        &self.inner.config
    }

    /// Returns the source.
    pub fn source(&self) -> &E {
        &self.inner.source
    }

    /// Returns a snapshot of the counters.
    pub fn stats(&self) -> IngestStats {
        self.inner.stats.read().clone()
    }

    /// Fetches and parses the source, retrying transient failures.
    ///
    /// Returns `Cancelled` if the session ends while the fetch is running.
    pub async fn fetch(&self) -> IngestResult<Parsed> {
        let (session, epoch) = self.inner.active_scope()?;
        self.inner
            .fetch(&session, epoch)
            .await
            .map(|(parsed, _)| parsed)
    }

    /// Merges items fetched under cache `epoch`.
    ///
    /// Returns `None` if the cache has been rebound since.
    pub fn merge(&self, epoch: u64, items: Vec<RawItem>) -> Option<ExternalMerge> {
        self.inner.merge(epoch, items)
    }

    /// Evicts expired external records.
    pub fn sweep(&self) -> usize {
        self.inner.sweep()
    }

    /// Runs one cycle: sweep, fetch, filter, merge.
    ///
    /// Ending the session cancels the cycle, including any backoff sleep.
    pub async fn run_cycle(&self) -> CycleResult {
        self.inner.run_cycle().await
    }

    /// Starts running cycles on the configured interval.
    ///
    /// A tick that finds a cycle still running is skipped and counted.
    /// Dropping the handle stops the scheduler.
    pub fn spawn(&self) -> IngestHandle {
        let (shutdown, mut stop) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let mut ticker = interval(inner.config.interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut current: Option<JoinHandle<()>> = None;

            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = ticker.tick() => {}
                }

                let busy = current.as_ref().is_some_and(|c| !c.is_finished())
                    || inner.inflight.lock().is_some();
                if busy {
                    debug!(namespace = %inner.config.namespace, "cycle still running, skipping tick");
                    inner.stats.write().cycles_skipped += 1;
                    continue;
                }

                let cycle = Arc::clone(&inner);
                current = Some(tokio::spawn(async move {
                    // Outcome is already logged and counted.
                    let _ = cycle.run_cycle().await;
                }));
            }

            if let Some(cycle) = current {
                cycle.abort();
            }
            debug!(namespace = %inner.config.namespace, "ingestion scheduler stopped");
        });

        IngestHandle { shutdown, task }
    }
}

impl<E: ExternalSource + 'static> Inner<E> {
    /// Returns the session and the cache epoch bound to it.
    ///
    /// A session whose identity token has lapsed is refused, so the bearer
    /// is never sent after expiry.
    fn active_scope(&self) -> IngestResult<(Arc<Session>, u64)> {
        let session = self
            .sessions
            .current_session()
            .ok_or(IngestError::NoSession)?;
        if session.is_expired() {
            return Err(IngestError::Unauthorized("session expired".into()));
        }
        match self.cache.scope() {
            Some(scope) if scope.user_id == session.user_id() => Ok((session, scope.epoch)),
            _ => Err(IngestError::NoSession),
        }
    }

    /// Fetches with retries until `epoch` ends.
    async fn fetch(&self, session: &Session, epoch: u64) -> IngestResult<(Parsed, u32)> {
        let retry = &self.config.retry;
        let mut last_error = IngestError::network_retryable("no fetch attempt made");
        let ended = self.cache.epoch_ended(epoch);
        tokio::pin!(ended);

        for attempt in 0..retry.max_attempts {
            if attempt > 0 {
                let delay = retry.delay_for_attempt(attempt);
                debug!(attempt, ?delay, source = %self.source.describe(), "retrying fetch");
                tokio::select! {
                    _ = &mut ended => return Err(self.cancelled(attempt)),
                    _ = sleep(delay) => {}
                }
            }

            let result = tokio::select! {
                _ = &mut ended => return Err(self.cancelled(attempt + 1)),
                result = timeout(
                    self.config.fetch_timeout,
                    self.source.fetch(Some(session.id_token())),
                ) => result.unwrap_or_else(|_| Err(IngestError::network_retryable("fetch timed out"))),
            };

            match result {
                Ok(body) => {
                    let parsed = parse(&body, &self.config.format)?;
                    return Ok((parsed, attempt + 1));
                }
                Err(e) if e.is_retryable() => {
                    debug!(attempt, error = %e, "fetch attempt failed");
                    last_error = e;
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error)
    }

    fn cancelled(&self, attempts: u32) -> IngestError {
        debug!(attempts, source = %self.source.describe(), "session ended, fetch abandoned");
        IngestError::Cancelled
    }

    fn merge(&self, epoch: u64, items: Vec<RawItem>) -> Option<ExternalMerge> {
        let expires_at = now() + self.config.freshness;
        let items = items
            .into_iter()
            .map(|item| (self.config.cache_key(&item.key), item.payload))
            .collect();
        self.cache.merge_external(epoch, items, expires_at)
    }

    fn sweep(&self) -> usize {
        let removed = self.cache.sweep_expired(now());
        if removed > 0 {
            debug!(removed, "evicted expired external records");
        }
        removed
    }

    async fn run_cycle(&self) -> CycleResult {
        let waiter = {
            let mut slot = self.inflight.lock();
            let existing = slot.as_ref().map(|tx| tx.subscribe());
            if existing.is_none() {
                let (tx, _) = broadcast::channel(1);
                *slot = Some(tx);
            }
            existing
        };

        if let Some(mut rx) = waiter {
            debug!(namespace = %self.config.namespace, "joining in-flight cycle");
            return rx.recv().await.unwrap_or(Err(IngestError::Cancelled));
        }

        let guard = InflightGuard {
            slot: &self.inflight,
        };
        let result = self.cycle().await;
        self.record(&result);
        if let Some(tx) = guard.take() {
            // No receivers is fine: nobody joined.
            let _ = tx.send(result.clone());
        }
        result
    }

    async fn cycle(&self) -> CycleResult {
        let (session, epoch) = self.active_scope()?;
        let mut report = CycleReport {
            expired: self.sweep(),
            ..CycleReport::default()
        };

        let (parsed, attempts) = self.fetch(&session, epoch).await?;
        report.attempts = attempts;
        report.fetched = parsed.items.len();
        report.parse_failures = parsed.failures;

        let items: Vec<RawItem> = parsed
            .items
            .into_iter()
            .filter(|item| self.config.keeps(item))
            .collect();
        report.filtered = report.fetched - items.len();

        match self.merge(epoch, items) {
            Some(merge) => report.merge = merge,
            None => {
                debug!(epoch, "session changed during fetch, dropping items");
                report.discarded = true;
            }
        }
        Ok(report)
    }

    fn record(&self, result: &CycleResult) {
        let namespace = &self.config.namespace;
        let mut stats = self.stats.write();
        stats.last_cycle_time = Some(SystemTime::now());
        match result {
            Ok(report) => {
                stats.cycles_completed += 1;
                stats.items_merged += (report.merge.inserted + report.merge.refreshed) as u64;
                stats.parse_failures += report.parse_failures as u64;
                info!(
                    %namespace,
                    fetched = report.fetched,
                    filtered = report.filtered,
                    inserted = report.merge.inserted,
                    refreshed = report.merge.refreshed,
                    skipped = report.merge.skipped,
                    expired = report.expired,
                    parse_failures = report.parse_failures,
                    discarded = report.discarded,
                    "ingestion cycle complete"
                );
            }
            Err(IngestError::NoSession) => {
                stats.cycles_skipped += 1;
                debug!(%namespace, "no active session, cycle skipped");
            }
            Err(IngestError::Cancelled) => {
                stats.cycles_skipped += 1;
                debug!(%namespace, "session ended, cycle cancelled");
            }
            Err(e) => {
                stats.cycles_failed += 1;
                stats.last_error = Some(e.to_string());
                warn!(%namespace, error = %e, "ingestion cycle failed");
            }
        }
    }
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Clears the in-flight slot when the leading cycle finishes or is dropped.
struct InflightGuard<'a> {
    slot: &'a Mutex<Option<broadcast::Sender<CycleResult>>>,
}

impl InflightGuard<'_> {
    fn take(&self) -> Option<broadcast::Sender<CycleResult>> {
        self.slot.lock().take()
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.slot.lock().take();
    }
}

/// Handle to a running ingestion scheduler.
pub struct IngestHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl IngestHandle {
    /// Returns true while the scheduler is running.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stops the scheduler and aborts any cycle it started.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "ingestion scheduler task failed");
        }
    }
}
