//! # TideSync Protocol
//!
//! Data model shared by every TideSync component.
//!
//! This crate provides:
//! - `Record` and `Origin` for cached entries
//! - `RemoteEvent`, `WriteRequest`, `WriteAck` exchanged with the remote store
//! - `PendingWrite` and `PendingQueue` for unacknowledged local writes
//! - The reconciliation rule that resolves a remote update against local state
//! - `ChangeEvent` emitted whenever a cached record changes
//!
//! This is a pure crate with no I/O operations.
//!
//! ## Key Invariants
//!
//! - Exactly one authoritative version per key
//! - `dirty` is only set for unacknowledged local writes
//! - Remote versions only move forward; equal or lower versions are stale

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change;
mod event;
mod pending;
mod reconcile;
mod record;

pub use change::{ChangeEvent, ChangeKind};
pub use event::{RemoteEvent, WriteAck, WriteRequest};
pub use pending::{AttemptFailure, Enqueued, PendingQueue, PendingWrite, WriteId};
pub use reconcile::{reconcile, Reconciliation, WriteOutcome};
pub use record::{Origin, Record};

/// Structured payload carried by records and events.
pub type Payload = serde_json::Value;
