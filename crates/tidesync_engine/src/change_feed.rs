//! Change feed for observing cache mutations.
//!
//! The cache emits one [`ChangeEvent`] per mutated record, after its lock
//! is released. Subscribers receive events over unbounded channels, so a
//! slow observer never blocks a writer and can never re-enter the cache
//! from inside a write.

use parking_lot::RwLock;
use tidesync_protocol::ChangeEvent;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Distributes cache changes to subscribers.
///
/// The change feed:
/// - Preserves the order in which changes were applied
/// - Supports multiple subscribers
/// - Drops subscribers whose receiver was closed
pub struct ChangeFeed {
    subscribers: RwLock<Vec<UnboundedSender<ChangeEvent>>>,
}

impl ChangeFeed {
    /// Creates a new change feed.
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Subscribes to the change feed.
    ///
    /// Returns a receiver that will receive all future change events.
    pub fn subscribe(&self) -> UnboundedReceiver<ChangeEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Emits a change event to all subscribers.
    pub fn emit(&self, event: ChangeEvent) {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Emits the events of one cache mutation, in order.
    pub fn emit_batch(&self, events: Vec<ChangeEvent>) {
        if events.is_empty() {
            return;
        }
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| events.iter().all(|event| tx.send(event.clone()).is_ok()));
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}
