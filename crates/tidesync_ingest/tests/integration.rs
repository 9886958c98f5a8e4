//! Ingestion against a live sync engine and session manager.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tidesync_engine::{EngineConfig, MemoryRemoteStore, RetryConfig, SyncEngine};
use tidesync_ingest::{
    IngestConfig, IngestError, IngestPipeline, ResponseFormat, StaticSource,
};
use tidesync_protocol::{ChangeEvent, Origin};
use tidesync_session::{Credentials, HmacAuthProvider, SessionConfig, SessionManager};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, timeout, Instant};

const GAMES: &str = "id|home|away\ng1|Lions|Bears\ng2|Hawks|Owls\n";

struct Harness {
    sessions: Arc<SessionManager<Arc<HmacAuthProvider>>>,
    engine: SyncEngine<Arc<MemoryRemoteStore>>,
    store: Arc<MemoryRemoteStore>,
    source: Arc<StaticSource>,
    pipeline: IngestPipeline<Arc<StaticSource>>,
}

async fn harness() -> Harness {
    let provider = Arc::new(HmacAuthProvider::new("ingest-secret"));
    provider.add_user("fan@example.com", "pw");
    let sessions = Arc::new(SessionManager::new(SessionConfig::new(), Arc::clone(&provider)));

    let store = Arc::new(MemoryRemoteStore::new().with_verifier(provider.verifier()));
    let engine = SyncEngine::new(EngineConfig::new(), Arc::clone(&store));
    sessions.add_observer(Arc::new(engine.clone()));

    let session = sessions
        .authenticate(&Credentials::new("fan@example.com", "pw"))
        .await
        .unwrap();
    engine.open(session).await.unwrap();

    let source = Arc::new(StaticSource::new(GAMES));
    let pipeline = IngestPipeline::new(
        IngestConfig::new("games", ResponseFormat::delimited('|', "id")),
        Arc::clone(&source),
        engine.cache(),
        sessions.clone(),
    );

    Harness {
        sessions,
        engine,
        store,
        source,
        pipeline,
    }
}

async fn next_change_for(changes: &mut UnboundedReceiver<ChangeEvent>, key: &str) -> ChangeEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            let event = changes.recv().await.expect("change feed closed");
            if event.key == key {
                return event;
            }
        }
    })
    .await
    .expect("no change for key")
}

#[tokio::test]
async fn ingested_record_is_replaced_by_remote_update() {
    let h = harness().await;
    let mut changes = h.engine.subscribe();

    let report = h.pipeline.run_cycle().await.unwrap();
    assert_eq!(report.merge.inserted, 2);
    let change = next_change_for(&mut changes, "games/g1").await;
    assert_eq!(change.origin, Origin::External);

    let token = h.sessions.current_session().unwrap().id_token().to_string();
    assert_eq!(h.source.last_bearer(), Some(token));

    let user = h.sessions.current_session().unwrap().user_id().to_string();
    let version = h.store.remote_put(&user, "games/g1", json!({"home": "Lions", "final": true}));
    let change = next_change_for(&mut changes, "games/g1").await;
    assert_eq!(change.origin, Origin::Remote);

    let record = h.engine.get("games/g1").unwrap();
    assert_eq!(record.origin, Origin::Remote);
    assert_eq!(record.version, version);
    assert_eq!(record.expires_at, None);

    // The next cycle leaves the remote record alone.
    let report = h.pipeline.run_cycle().await.unwrap();
    assert_eq!(report.merge.skipped, 1);
    assert_eq!(report.merge.refreshed, 1);
    assert_eq!(h.engine.get("games/g1").unwrap().origin, Origin::Remote);
    h.engine.close().await;
}

#[tokio::test]
async fn ingestion_never_overwrites_local_write() {
    let h = harness().await;
    let handle = h.engine.put("games/g2", json!({"note": "mine"})).unwrap();

    let report = h.pipeline.run_cycle().await.unwrap();
    assert_eq!(report.merge.inserted, 1);
    assert_eq!(report.merge.skipped, 1);

    handle.outcome().await.unwrap();
    let record = h.engine.get("games/g2").unwrap();
    assert_eq!(record.payload, json!({"note": "mine"}));
    assert_eq!(record.origin, Origin::Local);
    h.engine.close().await;
}

#[tokio::test]
async fn sign_out_stops_ingestion() {
    let h = harness().await;
    h.pipeline.run_cycle().await.unwrap();
    assert_eq!(h.engine.cache().len(), 2);

    h.sessions.sign_out().await;
    assert!(h.engine.cache().is_empty());

    let calls = h.source.calls();
    assert_eq!(h.pipeline.run_cycle().await, Err(IngestError::NoSession));
    assert_eq!(h.source.calls(), calls);
}

#[tokio::test(start_paused = true)]
async fn sign_out_cancels_retrying_fetch() {
    let h = harness().await;
    let config = IngestConfig::new("games", ResponseFormat::delimited('|', "id")).with_retry(
        RetryConfig::new(6)
            .with_initial_delay(Duration::from_secs(10))
            .with_jitter(false),
    );
    let source = Arc::new(StaticSource::new(GAMES));
    for _ in 0..6 {
        source.push_response(Err(IngestError::network_retryable("down")));
    }
    let pipeline = IngestPipeline::new(
        config,
        Arc::clone(&source),
        h.engine.cache(),
        h.sessions.clone(),
    );

    let running = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { pipeline.run_cycle().await })
    };
    sleep(Duration::from_secs(1)).await;
    let signed_out_at = Instant::now();
    h.sessions.sign_out().await;

    assert_eq!(running.await.unwrap(), Err(IngestError::Cancelled));
    assert!(signed_out_at.elapsed() < Duration::from_secs(10));
    assert_eq!(source.calls(), 1);
}
