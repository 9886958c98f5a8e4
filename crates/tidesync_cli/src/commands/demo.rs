//! Demo command implementation.
//!
//! Signs in while the remote store is offline, writes locally, reconnects,
//! ingests external data, lets another device overwrite one ingested
//! record, then signs out.

use super::{local_client, local_credentials};
use serde_json::json;
use std::time::Duration;
use tidesync_ingest::{IngestConfig, ResponseFormat, StaticSource};
use tidesync_protocol::Record;
use tracing::info;

const SCHEDULE: &str = r#"{"races":[
    {"id":"bahrain","name":"Bahrain Grand Prix","round":1},
    {"id":"jeddah","name":"Saudi Arabian Grand Prix","round":2},
    {"id":"melbourne","name":"Australian Grand Prix","round":3}
],"count":3}"#;

/// Runs the demo command.
pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    info!("Running demo against the in-memory store");
    let (client, store) = local_client();
    client.add_source(
        IngestConfig::new("races", ResponseFormat::json_array("races", "id"))
            .with_freshness(Duration::from_secs(60)),
        StaticSource::new(SCHEDULE),
    );

    println!("== sign in with the remote store offline");
    store.set_online(false);
    let session = client.authenticate(&local_credentials()).await?;
    println!("user {} signed in, engine {:?}", session.user_id(), client.state());

    println!("\n== write while offline");
    let handle = client.put("profile/name", json!("Ada"))?;
    print_record(client.get("profile/name"));

    println!("\n== network restored");
    store.set_online(true);
    client.refresh().await?;
    let version = handle.outcome().await?;
    println!("write acknowledged at version {version}, engine {:?}", client.state());
    print_record(client.get("profile/name"));

    println!("\n== ingest external schedule");
    for (namespace, result) in client.ingest_now().await {
        let report = result?;
        println!(
            "{namespace}: fetched {}, inserted {}, refreshed {}, skipped {}",
            report.fetched, report.merge.inserted, report.merge.refreshed, report.merge.skipped
        );
    }
    print_record(client.get("races/jeddah"));

    println!("\n== another device updates an ingested record");
    let mut changes = client.subscribe();
    store.remote_put(
        session.user_id(),
        "races/jeddah",
        json!({"id": "jeddah", "name": "Saudi Arabian Grand Prix", "winner": "PIA"}),
    );
    while let Some(change) = changes.recv().await {
        if change.key == "races/jeddah" {
            break;
        }
    }
    print_record(client.get("races/jeddah"));

    println!("\n== sign out");
    client.sign_out().await;
    info!("Demo finished");
    println!(
        "engine {:?}, session present: {}, cached records: {}",
        client.state(),
        client.current_session().is_some(),
        client.engine().cache().len()
    );
    Ok(())
}

fn print_record(record: Option<Record>) {
    match record {
        Some(r) => println!(
            "{} = {} (origin {}, version {}, dirty {})",
            r.key, r.payload, r.origin, r.version, r.dirty
        ),
        None => println!("(missing)"),
    }
}
