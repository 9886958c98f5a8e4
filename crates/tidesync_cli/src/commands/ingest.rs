//! Ingest command implementation.

use super::{local_client, local_credentials};
use serde::Serialize;
use tidesync_ingest::{ExternalSource, HttpSource, IngestConfig, ResponseFormat};
use tracing::{info, warn};

/// Options for one ingestion run.
pub struct IngestOptions {
    /// URL to fetch.
    pub url: String,
    /// Response body layout.
    pub format: ResponseFormat,
    /// Prefix for ingested keys.
    pub namespace: String,
    /// Static bearer token for the API.
    pub bearer: Option<String>,
    /// POST body, if the API expects one.
    pub post: Option<String>,
}

/// Ingestion result.
#[derive(Debug, Serialize)]
pub struct IngestSummary {
    /// Source that was fetched.
    pub source: String,
    /// Items parsed.
    pub fetched: usize,
    /// Items skipped as malformed.
    pub parse_failures: usize,
    /// Fetch attempts made.
    pub attempts: u32,
    /// Records now in the cache.
    pub records: Vec<IngestedRecord>,
}

/// One ingested record.
#[derive(Debug, Serialize)]
pub struct IngestedRecord {
    /// Cache key.
    pub key: String,
    /// Record payload.
    pub payload: serde_json::Value,
}

/// Runs the ingest command.
pub async fn run(options: IngestOptions, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut source = HttpSource::new(&options.url)?;
    if let Some(token) = &options.bearer {
        source = source.with_header("Authorization", format!("Bearer {token}"));
    }
    if let Some(body) = options.post {
        source = source.post(body);
    }
    let description = source.describe();
    info!("Ingesting from {}", description);

    let (client, _store) = local_client();
    client.authenticate(&local_credentials()).await?;
    let pipeline = client.add_source(IngestConfig::new(options.namespace, options.format), source);

    let report = pipeline.run_cycle().await;
    let report = match report {
        Ok(report) => report,
        Err(e) => {
            warn!("Ingestion from {} failed: {}", description, e);
            client.sign_out().await;
            return Err(e.into());
        }
    };

    let summary = IngestSummary {
        source: description,
        fetched: report.fetched,
        parse_failures: report.parse_failures,
        attempts: report.attempts,
        records: client
            .engine()
            .cache()
            .records()
            .into_iter()
            .map(|r| IngestedRecord {
                key: r.key,
                payload: r.payload,
            })
            .collect(),
    };
    client.sign_out().await;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_text(&summary);
    }
    Ok(())
}

fn print_text(summary: &IngestSummary) {
    println!("Source: {}", summary.source);
    println!(
        "Fetched {} item(s) in {} attempt(s), {} malformed",
        summary.fetched, summary.attempts, summary.parse_failures
    );
    println!();
    for record in &summary.records {
        println!("{:<32} {}", record.key, record.payload);
    }
}
