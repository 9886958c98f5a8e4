//! # TideSync Ingest
//!
//! Periodically pulls read-only data from external HTTP APIs into the
//! session cache.
//!
//! Each pipeline owns one source and one response format. A cycle sweeps
//! expired records, fetches with bounded retry, parses, and merges through
//! `Cache::merge_external`, which never lets external data replace a local
//! or remote record.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod parse;
mod pipeline;
mod source;

pub use config::{IngestConfig, ItemFilter};
pub use error::{IngestError, IngestResult};
pub use parse::{parse, Parsed, RawItem, ResponseFormat};
pub use pipeline::{CurrentSession, CycleReport, IngestHandle, IngestPipeline, IngestStats};
pub use source::{ExternalSource, HttpSource, StaticSource};
