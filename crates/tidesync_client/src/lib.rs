//! # TideSync Client
//!
//! Offline-first data access for an application.
//!
//! `Client` wires the three TideSync components together:
//! - a `SessionManager` for sign-in, refresh and sign-out
//! - a `SyncEngine` that keeps the session cache in step with the remote store
//! - `IngestPipeline`s that pull read-only data from external APIs
//!
//! ```no_run
//! # async fn demo() -> Result<(), tidesync_client::ClientError> {
//! use std::sync::Arc;
//! use tidesync_client::Client;
//! use tidesync_engine::MemoryRemoteStore;
//! use tidesync_session::{Credentials, HmacAuthProvider};
//!
//! let provider = Arc::new(HmacAuthProvider::new("secret"));
//! provider.add_user("ada@example.com", "pw");
//! let store = MemoryRemoteStore::new().with_verifier(provider.verifier());
//!
//! let client = Client::new(provider, store);
//! client.authenticate(&Credentials::new("ada@example.com", "pw")).await?;
//! let handle = client.put("note", serde_json::json!("hello"))?;
//! assert_eq!(client.get("note").unwrap().payload, "hello");
//! handle.outcome().await?;
//! client.sign_out().await;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod config;
mod error;

pub use client::{Client, SharedPipeline};
pub use config::ClientConfig;
pub use error::{ClientError, ClientResult};
