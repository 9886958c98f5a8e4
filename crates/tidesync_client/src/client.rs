//! The client facade.

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tidesync_engine::{EngineState, RemoteStore, SyncEngine, SyncError, WriteHandle};
use tidesync_ingest::{
    CurrentSession, CycleReport, ExternalSource, IngestConfig, IngestHandle, IngestPipeline,
    IngestResult,
};
use tidesync_protocol::{ChangeEvent, Payload, Record};
use tidesync_session::{AuthProvider, Credentials, Session, SessionManager};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

/// Ingestion pipeline over any boxed source.
pub type SharedPipeline = IngestPipeline<Arc<dyn ExternalSource>>;

/// Single entry point for an application.
///
/// Owns one session manager, one sync engine bound to it, and any number
/// of ingestion pipelines writing into the engine's cache. Signing out
/// stops ingestion and clears every session-scoped structure before it
/// returns.
pub struct Client<P, S>
where
    P: AuthProvider + 'static,
    S: RemoteStore + 'static,
{
    sessions: Arc<SessionManager<P>>,
    engine: SyncEngine<S>,
    pipelines: RwLock<Vec<SharedPipeline>>,
    schedulers: Mutex<Vec<IngestHandle>>,
}

impl<P, S> Client<P, S>
where
    P: AuthProvider + 'static,
    S: RemoteStore + 'static,
{
    /// Creates a client with default configuration.
    pub fn new(provider: P, store: S) -> Self {
        Self::with_config(ClientConfig::default(), provider, store)
    }

    /// Creates a client.
    pub fn with_config(config: ClientConfig, provider: P, store: S) -> Self {
        let sessions = Arc::new(SessionManager::new(config.session, provider));
        let engine = SyncEngine::new(config.engine, store);
        sessions.add_observer(Arc::new(engine.clone()));
        Self {
            sessions,
            engine,
            pipelines: RwLock::new(Vec::new()),
            schedulers: Mutex::new(Vec::new()),
        }
    }

    /// Returns the session manager.
    pub fn sessions(&self) -> &Arc<SessionManager<P>> {
        &self.sessions
    }

    /// Returns the sync engine.
    pub fn engine(&self) -> &SyncEngine<S> {
        &self.engine
    }

    /// Returns the sync engine state.
    pub fn state(&self) -> EngineState {
        self.engine.state()
    }

    /// Registers an external source and returns its pipeline.
    ///
    /// The pipeline joins the scheduler on the next `start_ingestion`.
    pub fn add_source(
        &self,
        config: IngestConfig,
        source: impl ExternalSource + 'static,
    ) -> SharedPipeline {
        let sessions: Arc<dyn CurrentSession> = self.sessions.clone();
        let source: Arc<dyn ExternalSource> = Arc::new(source);
        let pipeline = IngestPipeline::new(config, source, self.engine.cache(), sessions);
        self.pipelines.write().push(pipeline.clone());
        pipeline
    }

    /// Signs in and opens the sync engine for the new session.
    ///
    /// An unreachable remote store is not an error: the engine stays
    /// offline, local writes queue up, and `refresh` retries the connection.
    pub async fn authenticate(&self, credentials: &Credentials) -> ClientResult<Arc<Session>> {
        let session = self.sessions.authenticate(credentials).await?;
        self.open_engine(Arc::clone(&session)).await?;
        info!(user_id = %session.user_id(), state = ?self.engine.state(), "signed in");
        Ok(session)
    }

    /// Refreshes the session and reconnects the engine if it is not live.
    pub async fn refresh(&self) -> ClientResult<Arc<Session>> {
        let session = self.sessions.refresh().await?;
        if self.engine.state() != EngineState::Live {
            debug!(state = ?self.engine.state(), "reconnecting after refresh");
            self.open_engine(Arc::clone(&session)).await?;
        }
        Ok(session)
    }

    /// Stops ingestion and ends the session.
    ///
    /// On return the cache is empty and `current_session` is `None`.
    pub async fn sign_out(&self) {
        self.stop_ingestion().await;
        self.sessions.sign_out().await;
    }

    /// Returns the active session, if any.
    pub fn current_session(&self) -> Option<Arc<Session>> {
        self.sessions.current_session()
    }

    /// Writes a record locally and queues it for the remote store.
    pub fn put(&self, key: &str, payload: Payload) -> ClientResult<WriteHandle> {
        Ok(self.engine.put(key, payload)?)
    }

    /// Reads a record from the cache.
    pub fn get(&self, key: &str) -> Option<Record> {
        self.engine.get(key)
    }

    /// Subscribes to changes from every origin.
    pub fn subscribe(&self) -> UnboundedReceiver<ChangeEvent> {
        self.engine.subscribe()
    }

    /// Runs one cycle of every pipeline, in registration order.
    ///
    /// Returns each pipeline's namespace with its result.
    pub async fn ingest_now(&self) -> Vec<(String, IngestResult<CycleReport>)> {
        let pipelines = self.pipelines.read().clone();
        let mut results = Vec::with_capacity(pipelines.len());
        for pipeline in pipelines {
            let result = pipeline.run_cycle().await;
            results.push((pipeline.config().namespace.clone(), result));
        }
        results
    }

    /// Starts the scheduler of every registered pipeline.
    ///
    /// Does nothing if ingestion is already running.
    pub fn start_ingestion(&self) {
        let mut schedulers = self.schedulers.lock();
        if !schedulers.is_empty() {
            return;
        }
        let pipelines = self.pipelines.read();
        schedulers.extend(pipelines.iter().map(|p| p.spawn()));
        info!(pipelines = schedulers.len(), "ingestion started");
    }

    /// Returns true while ingestion schedulers are running.
    pub fn is_ingesting(&self) -> bool {
        self.schedulers.lock().iter().any(|h| h.is_running())
    }

    /// Stops every ingestion scheduler.
    pub async fn stop_ingestion(&self) {
        let schedulers = std::mem::take(&mut *self.schedulers.lock());
        for handle in schedulers {
            handle.stop().await;
        }
    }

    async fn open_engine(&self, session: Arc<Session>) -> ClientResult<()> {
        match self.engine.open(session).await {
            Ok(()) => Ok(()),
            Err(e @ (SyncError::Unreachable(_) | SyncError::Timeout)) => {
                warn!(error = %e, "remote store unreachable, working offline");
                Ok(())
            }
            Err(SyncError::Unauthorized(message)) => {
                warn!(%message, "remote store rejected the session, signing out");
                self.sign_out().await;
                Err(ClientError::Sync(SyncError::Unauthorized(message)))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tidesync_engine::MemoryRemoteStore;
    use tidesync_session::{AuthError, HmacAuthProvider, SessionState};

    fn client() -> Client<Arc<HmacAuthProvider>, Arc<MemoryRemoteStore>> {
        let provider = Arc::new(HmacAuthProvider::new("client-secret"));
        provider.add_user("ada@example.com", "pw");
        let store = Arc::new(MemoryRemoteStore::new().with_verifier(provider.verifier()));
        Client::new(provider, store)
    }

    fn credentials() -> Credentials {
        Credentials::new("ada@example.com", "pw")
    }

    #[tokio::test]
    async fn put_before_sign_in_fails() {
        let client = client();
        assert_eq!(
            client.put("a", json!(1)).unwrap_err(),
            ClientError::Sync(SyncError::NotOpen)
        );
    }

    #[tokio::test]
    async fn bad_credentials_leave_client_signed_out() {
        let client = client();
        let err = client
            .authenticate(&Credentials::new("ada@example.com", "wrong"))
            .await
            .unwrap_err();
        assert_eq!(err, ClientError::Auth(AuthError::InvalidCredentials));
        assert!(client.current_session().is_none());
        assert_eq!(client.state(), EngineState::Closed);
    }

    #[tokio::test]
    async fn sign_in_opens_engine() {
        let client = client();
        let session = client.authenticate(&credentials()).await.unwrap();
        assert_eq!(client.state(), EngineState::Live);
        assert_eq!(client.engine().session().unwrap().user_id(), session.user_id());

        client.sign_out().await;
        assert_eq!(client.sessions().state(), SessionState::Unauthenticated);
        assert_eq!(client.state(), EngineState::Closed);
    }

    #[tokio::test]
    async fn start_ingestion_is_idempotent() {
        let client = client();
        client.add_source(
            IngestConfig::default(),
            tidesync_ingest::StaticSource::new("{}"),
        );
        client.start_ingestion();
        client.start_ingestion();
        assert_eq!(client.schedulers.lock().len(), 1);
        assert!(client.is_ingesting());

        client.stop_ingestion().await;
        assert!(!client.is_ingesting());
    }
}
