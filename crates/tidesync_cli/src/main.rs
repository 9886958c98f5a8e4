//! TideSync CLI
//!
//! Command-line tools for TideSync.
//!
//! # Commands
//!
//! - `ingest` - Run one ingestion cycle against an external API and print the records
//! - `demo` - Walk through an offline-first session against the in-memory store
//! - `version` - Show version information

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use tidesync_ingest::ResponseFormat;
use tracing_subscriber::EnvFilter;

/// TideSync command-line tools.
#[derive(Parser)]
#[command(name = "tidesync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum BodyFormat {
    Json,
    Delimited,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch an external API once and print the ingested records
    Ingest {
        /// URL to fetch
        url: String,

        /// Response body layout
        #[arg(long, value_enum, default_value = "json")]
        body: BodyFormat,

        /// JSON field holding the items
        #[arg(long)]
        array_key: Option<String>,

        /// Item field (or header column) holding the record key
        #[arg(long)]
        key_field: Option<String>,

        /// Field separator for delimited bodies
        #[arg(long, default_value = "|")]
        delimiter: char,

        /// Prefix for ingested keys
        #[arg(short, long, default_value = "")]
        namespace: String,

        /// Bearer token sent to the API
        #[arg(long)]
        bearer: Option<String>,

        /// Send a POST with this JSON body instead of a GET
        #[arg(long)]
        post: Option<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Run an end-to-end demo against the in-memory store
    Demo,

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Ingest {
            url,
            body,
            array_key,
            key_field,
            delimiter,
            namespace,
            bearer,
            post,
            format,
        } => {
            let response_format = match body {
                BodyFormat::Json => ResponseFormat::Json {
                    array_key,
                    key_field,
                },
                BodyFormat::Delimited => {
                    let key_field =
                        key_field.ok_or("--key-field is required for delimited bodies")?;
                    ResponseFormat::delimited(delimiter, key_field)
                }
            };
            let options = commands::ingest::IngestOptions {
                url,
                format: response_format,
                namespace,
                bearer,
                post,
            };
            commands::ingest::run(options, &format).await?;
        }
        Commands::Demo => {
            commands::demo::run().await?;
        }
        Commands::Version => {
            println!("TideSync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_delimited_ingest() {
        let cli = Cli::try_parse_from([
            "tidesync",
            "-v",
            "ingest",
            "https://example.com/games.txt",
            "--body",
            "delimited",
            "--key-field",
            "id",
            "--namespace",
            "games",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Ingest {
                url,
                body,
                key_field,
                delimiter,
                namespace,
                ..
            } => {
                assert_eq!(url, "https://example.com/games.txt");
                assert!(matches!(body, BodyFormat::Delimited));
                assert_eq!(key_field.as_deref(), Some("id"));
                assert_eq!(delimiter, '|');
                assert_eq!(namespace, "games");
            }
            _ => panic!("expected ingest"),
        }
    }
}
