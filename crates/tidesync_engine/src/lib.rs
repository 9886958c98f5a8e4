//! # TideSync Engine
//!
//! Keeps a session-scoped local cache consistent with a remote store.
//!
//! This crate provides:
//! - `Cache`, the single merge gate for local writes, remote updates and
//!   external data
//! - `SyncEngine`, which owns the subscription listener and the
//!   pending-write pusher
//! - `RemoteStore`, the capability the engine talks to, and
//!   `MemoryRemoteStore`, an in-process reference store
//! - Bounded, jittered retry with exponential backoff
//!
//! ## Key Invariants
//!
//! - `put` followed by `get` observes the write, online or not
//! - Out-of-order remote updates converge to the same state
//! - External data never overwrites local or remote records
//! - Nothing from a previous session survives `close`

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod change_feed;
mod config;
mod engine;
mod error;
mod memory;
mod store;

pub use cache::{Cache, CacheScope, ExternalMerge, RemoteApplied};
pub use change_feed::ChangeFeed;
pub use config::{EngineConfig, RetryConfig};
pub use engine::{EngineState, EngineStats, SyncEngine, WriteHandle};
pub use error::{SyncError, SyncResult};
pub use memory::MemoryRemoteStore;
pub use store::{RemoteStore, Subscription};
