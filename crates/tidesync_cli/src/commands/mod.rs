//! CLI command implementations.

pub mod demo;
pub mod ingest;

use std::sync::Arc;
use tidesync_client::Client;
use tidesync_engine::MemoryRemoteStore;
use tidesync_session::{Credentials, HmacAuthProvider};

/// Client backed by in-process identity and storage.
pub type LocalClient = Client<Arc<HmacAuthProvider>, Arc<MemoryRemoteStore>>;

/// Local identity used by the commands.
pub const LOCAL_USER: (&str, &str) = ("cli@localhost", "tidesync");

/// Builds a client against the in-memory store with one local account.
pub fn local_client() -> (LocalClient, Arc<MemoryRemoteStore>) {
    let provider = Arc::new(HmacAuthProvider::new("tidesync-cli"));
    provider.add_user(LOCAL_USER.0, LOCAL_USER.1);
    let store = Arc::new(MemoryRemoteStore::new().with_verifier(provider.verifier()));
    let client = Client::new(provider, Arc::clone(&store));
    (client, store)
}

/// Credentials of the local account.
pub fn local_credentials() -> Credentials {
    Credentials::new(LOCAL_USER.0, LOCAL_USER.1)
}
