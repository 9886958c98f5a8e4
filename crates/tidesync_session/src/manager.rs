//! Session lifecycle state machine.

use crate::config::SessionConfig;
use crate::error::{AuthError, AuthResult};
use crate::provider::{AuthProvider, Grant};
use crate::session::{Credentials, Session};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// The lifecycle state of the session manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session.
    Unauthenticated,
    /// Sign-in in progress.
    Authenticating,
    /// A session is active.
    Authenticated,
    /// A refresh is in progress; the previous session stays readable.
    Refreshing,
    /// The identity token has lapsed, or a refresh failed.
    ///
    /// A failed refresh passes straight to `Unauthenticated`. A lapsed
    /// token is reported until `refresh` or `sign_out` runs.
    Expired,
}

impl SessionState {
    /// Returns true if a session is readable in this state.
    pub fn has_session(&self) -> bool {
        matches!(self, SessionState::Authenticated | SessionState::Refreshing)
    }
}

/// Hooks for components whose state is scoped to a session.
///
/// Observers are awaited in registration order. They must not call back
/// into the session manager from these hooks.
#[async_trait]
pub trait SessionObserver: Send + Sync {
    /// Called after a refresh replaced the session.
    async fn session_refreshed(&self, _session: Arc<Session>) {}

    /// Called when the session ends. Teardown must be complete on return.
    async fn session_ended(&self);
}

type RefreshResult = AuthResult<Arc<Session>>;

/// Owns the authenticated identity and its lifecycle.
///
/// `current_session` never waits on I/O. `authenticate`, `refresh` and
/// `sign_out` are the only transitions; there are no background retries.
pub struct SessionManager<P: AuthProvider> {
    config: SessionConfig,
    provider: P,
    session: RwLock<Option<Arc<Session>>>,
    state: watch::Sender<SessionState>,
    /// Advanced on every sign-in and sign-out; in-flight results from an
    /// older epoch are discarded. Sign-out advances it under the `session`
    /// write lock, and results are installed under the same lock.
    epoch: AtomicU64,
    inflight_refresh: Mutex<Option<broadcast::Sender<RefreshResult>>>,
    observers: RwLock<Vec<Arc<dyn SessionObserver>>>,
}

impl<P: AuthProvider> SessionManager<P> {
    /// Creates a new session manager.
    pub fn new(config: SessionConfig, provider: P) -> Self {
        let (state, _) = watch::channel(SessionState::Unauthenticated);
        Self {
            config,
            provider,
            session: RwLock::new(None),
            state,
            epoch: AtomicU64::new(0),
            inflight_refresh: Mutex::new(None),
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Returns the identity provider.
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Registers a session observer.
    pub fn add_observer(&self, observer: Arc<dyn SessionObserver>) {
        self.observers.write().push(observer);
    }

    /// Returns the current state.
    ///
    /// An `Authenticated` session whose identity token has lapsed reads as
    /// `Expired`. Lapsing is not a transition, so state subscribers are
    /// not notified of it.
    pub fn state(&self) -> SessionState {
        let state = *self.state.borrow();
        let lapsed = state == SessionState::Authenticated
            && self.session.read().as_ref().is_some_and(|s| s.is_expired());
        if lapsed {
            SessionState::Expired
        } else {
            state
        }
    }

    /// Returns a receiver that observes state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Returns the active session, if any. Never blocks on I/O.
    ///
    /// The session is returned even after its identity token lapses, since
    /// its refresh token is still needed; check `needs_refresh` or
    /// `Session::is_expired` before presenting the identity token.
    pub fn current_session(&self) -> Option<Arc<Session>> {
        self.session.read().clone()
    }

    /// Returns true if the active session should be refreshed soon.
    pub fn needs_refresh(&self) -> bool {
        self.current_session()
            .is_some_and(|s| s.expires_within(self.config.refresh_skew))
    }

    fn set_state(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = ?previous, to = ?next, "session state transition");
        }
    }

    async fn with_timeout<T>(&self, call: impl Future<Output = AuthResult<T>>) -> AuthResult<T> {
        match tokio::time::timeout(self.config.network_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(AuthError::network("identity provider timed out")),
        }
    }

    fn session_from_grant(grant: Grant, generation: u64) -> Arc<Session> {
        Arc::new(Session::new(
            grant.user_id,
            grant.id_token,
            grant.refresh_token,
            SystemTime::now() + grant.expires_in,
            generation,
        ))
    }

    /// Signs in with the given credentials.
    ///
    /// An existing session is ended first. On failure the manager returns
    /// to `Unauthenticated` and observers clear session-scoped state.
    pub async fn authenticate(&self, credentials: &Credentials) -> AuthResult<Arc<Session>> {
        if self.current_session().is_some() {
            self.sign_out().await;
        }

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_state(SessionState::Authenticating);
        debug!(email = %credentials.email, "authenticating");

        let result = self
            .with_timeout(self.provider.sign_in(credentials))
            .await;

        if self.epoch.load(Ordering::SeqCst) != epoch {
            debug!("sign-in result discarded after sign-out");
            return Err(AuthError::SignedOut);
        }

        match result {
            Ok(grant) => {
                let session = Self::session_from_grant(grant, 0);
                if !self.install(epoch, &session) {
                    debug!("sign-in result discarded after sign-out");
                    return Err(AuthError::SignedOut);
                }
                info!(user_id = %session.user_id(), "authenticated");
                Ok(session)
            }
            Err(e) => {
                warn!(error = %e, "authentication failed");
                self.end_session(SessionState::Unauthenticated).await;
                Err(e)
            }
        }
    }

    /// Refreshes the session.
    ///
    /// Only one refresh runs at a time; concurrent callers wait for and
    /// share its result. If `sign_out` runs meanwhile, the result is
    /// discarded and `SignedOut` is returned. A failed refresh ends the
    /// session (`Expired` → `Unauthenticated`).
    pub async fn refresh(&self) -> AuthResult<Arc<Session>> {
        let waiter = {
            let mut slot = self.inflight_refresh.lock();
            let existing = slot.as_ref().map(|tx| tx.subscribe());
            if existing.is_none() {
                let (tx, _) = broadcast::channel(1);
                *slot = Some(tx);
            }
            existing
        };

        if let Some(mut rx) = waiter {
            debug!("joining in-flight refresh");
            return match rx.recv().await {
                Ok(result) => result,
                Err(_) => Err(AuthError::network("refresh was abandoned")),
            };
        }

        let guard = InflightGuard {
            slot: &self.inflight_refresh,
        };
        let result = self.refresh_leader().await;
        if let Some(tx) = guard.take() {
            // No receivers is fine: nobody else was waiting.
            let _ = tx.send(result.clone());
        }
        result
    }

    async fn refresh_leader(&self) -> RefreshResult {
        let current = self.current_session().ok_or(AuthError::NotAuthenticated)?;
        let epoch = self.epoch.load(Ordering::SeqCst);

        self.set_state(SessionState::Refreshing);
        debug!(generation = current.generation(), "refreshing session");

        let result = self
            .with_timeout(self.provider.refresh(current.refresh_token()))
            .await;

        if self.epoch.load(Ordering::SeqCst) != epoch {
            debug!("refresh result discarded after sign-out");
            return Err(AuthError::SignedOut);
        }

        match result {
            Ok(grant) => {
                let session = Self::session_from_grant(grant, current.generation() + 1);
                if !self.install(epoch, &session) {
                    debug!("refresh result discarded after sign-out");
                    return Err(AuthError::SignedOut);
                }
                info!(
                    user_id = %session.user_id(),
                    generation = session.generation(),
                    "session refreshed"
                );

                let observers = self.observers.read().clone();
                for observer in observers {
                    observer.session_refreshed(Arc::clone(&session)).await;
                }
                Ok(session)
            }
            Err(e) => {
                warn!(error = %e, "refresh failed, ending session");
                self.set_state(SessionState::Expired);
                self.end_session(SessionState::Unauthenticated).await;
                Err(e)
            }
        }
    }

    /// Installs `session` if no sign-in or sign-out has happened since
    /// `epoch` was read, and moves to `Authenticated`.
    ///
    /// Returns false if the result is stale.
    fn install(&self, epoch: u64, session: &Arc<Session>) -> bool {
        let mut current = self.session.write();
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return false;
        }
        *current = Some(Arc::clone(session));
        self.set_state(SessionState::Authenticated);
        true
    }

    /// Ends the session and waits for every observer to finish teardown.
    ///
    /// Idempotent. Any in-flight sign-in or refresh result is discarded.
    pub async fn sign_out(&self) {
        let had_session = {
            let mut current = self.session.write();
            self.epoch.fetch_add(1, Ordering::SeqCst);
            current.take().is_some()
        };
        self.end_session(SessionState::Unauthenticated).await;
        if had_session {
            info!("signed out");
        }
    }

    async fn end_session(&self, final_state: SessionState) {
        self.session.write().take();
        self.set_state(final_state);

        let observers = self.observers.read().clone();
        for observer in observers {
            observer.session_ended().await;
        }
    }
}

/// Clears the in-flight refresh slot if the leader is dropped early, so
/// waiters see a closed channel instead of hanging.
struct InflightGuard<'a> {
    slot: &'a Mutex<Option<broadcast::Sender<RefreshResult>>>,
}

impl InflightGuard<'_> {
    fn take(&self) -> Option<broadcast::Sender<RefreshResult>> {
        self.slot.lock().take()
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.slot.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::HmacAuthProvider;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    const SECRET: &[u8] = b"manager-test-secret";

    fn manager() -> (Arc<SessionManager<Arc<HmacAuthProvider>>>, Arc<HmacAuthProvider>) {
        let provider = Arc::new(HmacAuthProvider::new(SECRET));
        provider.add_user("fan@example.com", "gunners");
        let manager = Arc::new(SessionManager::new(
            SessionConfig::default(),
            Arc::clone(&provider),
        ));
        (manager, provider)
    }

    fn creds() -> Credentials {
        Credentials::new("fan@example.com", "gunners")
    }

    #[derive(Default)]
    struct CountingObserver {
        ended: AtomicUsize,
        refreshed: AtomicUsize,
    }

    #[async_trait]
    impl SessionObserver for CountingObserver {
        async fn session_refreshed(&self, _session: Arc<Session>) {
            self.refreshed.fetch_add(1, Ordering::SeqCst);
        }

        async fn session_ended(&self) {
            self.ended.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn state_checks() {
        assert!(SessionState::Authenticated.has_session());
        assert!(SessionState::Refreshing.has_session());
        assert!(!SessionState::Expired.has_session());
        assert!(!SessionState::Unauthenticated.has_session());
    }

    #[tokio::test]
    async fn authenticate_and_sign_out() {
        let (manager, _) = manager();
        assert_eq!(manager.state(), SessionState::Unauthenticated);
        assert!(manager.current_session().is_none());

        let session = manager.authenticate(&creds()).await.unwrap();
        assert_eq!(manager.state(), SessionState::Authenticated);
        assert_eq!(session.generation(), 0);
        assert_eq!(manager.current_session().unwrap().user_id(), session.user_id());

        manager.sign_out().await;
        assert_eq!(manager.state(), SessionState::Unauthenticated);
        assert!(manager.current_session().is_none());

        // Idempotent.
        manager.sign_out().await;
        assert_eq!(manager.state(), SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn failed_authentication_notifies_observers() {
        let (manager, _) = manager();
        let observer = Arc::new(CountingObserver::default());
        manager.add_observer(observer.clone());

        let result = manager
            .authenticate(&Credentials::new("fan@example.com", "wrong"))
            .await;
        assert_eq!(result.unwrap_err(), AuthError::InvalidCredentials);
        assert_eq!(manager.state(), SessionState::Unauthenticated);
        assert_eq!(observer.ended.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn offline_authentication_fails_with_network_error() {
        let (manager, provider) = manager();
        provider.set_online(false);
        let result = manager.authenticate(&creds()).await;
        assert!(matches!(result, Err(AuthError::NetworkUnavailable(_))));
        assert_eq!(manager.state(), SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn refresh_replaces_session() {
        let (manager, _) = manager();
        let observer = Arc::new(CountingObserver::default());
        manager.add_observer(observer.clone());

        let first = manager.authenticate(&creds()).await.unwrap();
        let second = manager.refresh().await.unwrap();

        assert_eq!(second.generation(), 1);
        assert_eq!(second.user_id(), first.user_id());
        assert_eq!(manager.current_session().unwrap().generation(), 1);
        assert_eq!(observer.refreshed.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state(), SessionState::Authenticated);
    }

    #[tokio::test]
    async fn lapsed_token_reads_as_expired_until_refreshed() {
        let provider = Arc::new(
            HmacAuthProvider::new(SECRET).with_id_lifetime(Duration::ZERO),
        );
        provider.add_user("fan@example.com", "gunners");
        let manager = SessionManager::new(SessionConfig::default(), Arc::clone(&provider));

        let session = manager.authenticate(&creds()).await.unwrap();
        assert!(session.is_expired());
        assert_eq!(manager.state(), SessionState::Expired);
        assert!(manager.needs_refresh());
        // Kept so the refresh token can be used.
        assert!(manager.current_session().is_some());

        manager.sign_out().await;
        assert_eq!(manager.state(), SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn stale_result_is_not_installed() {
        let (manager, _) = manager();
        let session = manager.authenticate(&creds()).await.unwrap();
        let epoch = manager.epoch.load(Ordering::SeqCst);

        manager.sign_out().await;
        assert!(!manager.install(epoch, &session));
        assert!(manager.current_session().is_none());
        assert_eq!(manager.state(), SessionState::Unauthenticated);

        let current = manager.epoch.load(Ordering::SeqCst);
        assert!(manager.install(current, &session));
        assert_eq!(manager.state(), SessionState::Authenticated);
    }

    #[tokio::test]
    async fn refresh_without_session() {
        let (manager, _) = manager();
        assert_eq!(manager.refresh().await, Err(AuthError::NotAuthenticated));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_refresh_is_single_flight() {
        let (manager, provider) = manager();
        manager.authenticate(&creds()).await.unwrap();
        provider.set_latency(Duration::from_millis(200));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move { manager.refresh().await }));
        }

        let mut generations = Vec::new();
        for handle in handles {
            generations.push(handle.await.unwrap().unwrap().generation());
        }

        assert_eq!(provider.refresh_calls(), 1);
        assert!(generations.iter().all(|g| *g == 1));
    }

    #[tokio::test]
    async fn failed_refresh_ends_session() {
        let (manager, provider) = manager();
        let observer = Arc::new(CountingObserver::default());
        manager.add_observer(observer.clone());

        let session = manager.authenticate(&creds()).await.unwrap();
        provider.revoke(session.user_id());

        let mut states = manager.subscribe_state();
        assert_eq!(manager.refresh().await, Err(AuthError::Expired));
        assert_eq!(manager.state(), SessionState::Unauthenticated);
        assert!(manager.current_session().is_none());
        assert_eq!(observer.ended.load(Ordering::SeqCst), 1);
        assert!(states.has_changed().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_times_out() {
        let provider = Arc::new(HmacAuthProvider::new(SECRET));
        provider.add_user("fan@example.com", "gunners");
        let manager = SessionManager::new(
            SessionConfig::default().with_network_timeout(Duration::from_millis(100)),
            Arc::clone(&provider),
        );
        manager.authenticate(&creds()).await.unwrap();

        provider.set_latency(Duration::from_secs(5));
        let result = manager.refresh().await;
        assert!(matches!(result, Err(AuthError::NetworkUnavailable(_))));
        assert_eq!(manager.state(), SessionState::Unauthenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn sign_out_discards_inflight_refresh() {
        let (manager, provider) = manager();
        let observer = Arc::new(CountingObserver::default());
        manager.add_observer(observer.clone());
        manager.authenticate(&creds()).await.unwrap();
        provider.set_latency(Duration::from_millis(500));

        let refreshing = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.refresh().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.state(), SessionState::Refreshing);

        manager.sign_out().await;
        assert_eq!(refreshing.await.unwrap(), Err(AuthError::SignedOut));
        assert!(manager.current_session().is_none());
        assert_eq!(manager.state(), SessionState::Unauthenticated);
        assert_eq!(observer.refreshed.load(Ordering::SeqCst), 0);
        assert_eq!(observer.ended.load(Ordering::SeqCst), 1);
    }
}
