//! Remote store abstraction.

use crate::error::SyncResult;
use async_trait::async_trait;
use std::sync::Arc;
use tidesync_protocol::{RemoteEvent, WriteAck, WriteRequest};
use tidesync_session::Session;
use tokio::sync::mpsc::UnboundedReceiver;

/// A live stream of remote updates for one session.
///
/// The stream ends (`next` returns `None`) when the remote drops the
/// connection; the engine then reconnects.
#[derive(Debug)]
pub struct Subscription {
    events: UnboundedReceiver<RemoteEvent>,
}

impl Subscription {
    /// Wraps a receiver of remote events.
    pub fn new(events: UnboundedReceiver<RemoteEvent>) -> Self {
        Self { events }
    }

    /// Waits for the next remote event.
    pub async fn next(&mut self) -> Option<RemoteEvent> {
        self.events.recv().await
    }
}

/// A remote store holds the authoritative copy of the user's data.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (hosted document stores, in-process for testing).
///
/// Implementations report rejected or expired sessions as
/// `SyncError::Unauthorized` and connectivity problems as
/// `SyncError::Unreachable`.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Opens a subscription scoped to the session's user.
    ///
    /// The stream starts with the current state of every key so a
    /// reconnecting client catches up.
    async fn subscribe(&self, session: &Session) -> SyncResult<Subscription>;

    /// Writes a record; the store assigns and returns its version.
    async fn write(&self, session: &Session, request: &WriteRequest) -> SyncResult<WriteAck>;
}

#[async_trait]
impl<S: RemoteStore + ?Sized> RemoteStore for Arc<S> {
    async fn subscribe(&self, session: &Session) -> SyncResult<Subscription> {
        (**self).subscribe(session).await
    }

    async fn write(&self, session: &Session, request: &WriteRequest) -> SyncResult<WriteAck> {
        (**self).write(session, request).await
    }
}
