//! Queue of local writes awaiting remote acknowledgment.

use crate::event::WriteRequest;
use crate::Payload;
use std::collections::{HashMap, VecDeque};
use std::time::Instant;
use uuid::Uuid;

/// Client-generated identifier of a single write.
pub type WriteId = Uuid;

/// Maximum number of superseded write ids remembered per key.
const MAX_SUPERSEDED: usize = 32;

/// A local mutation awaiting remote acknowledgment.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingWrite {
    /// Record key.
    pub key: String,
    /// Latest payload written for the key.
    pub payload: Payload,
    /// Identifier of the latest write.
    pub write_id: WriteId,
    /// Number of failed delivery attempts for the latest write.
    pub attempts: u32,
    /// Earlier writes for this key replaced before they were acknowledged.
    pub superseded: Vec<WriteId>,
    /// Write currently being delivered, if any.
    pub in_flight: Option<WriteId>,
    /// Earliest time the next attempt may start.
    pub retry_at: Option<Instant>,
}

impl PendingWrite {
    fn new(key: String, payload: Payload, write_id: WriteId) -> Self {
        Self {
            key,
            payload,
            write_id,
            attempts: 0,
            superseded: Vec::new(),
            in_flight: None,
            retry_at: None,
        }
    }

    /// Returns true if `write_id` belongs to an earlier write for this key.
    pub fn is_superseded(&self, write_id: &WriteId) -> bool {
        self.superseded.contains(write_id)
    }

    fn is_ready(&self, now: Instant) -> bool {
        self.in_flight.is_none() && self.retry_at.map_or(true, |at| at <= now)
    }
}

/// Result of enqueueing a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Enqueued {
    /// Identifier assigned to the new write.
    pub write_id: WriteId,
    /// Identifier of the write it replaced, if one was still pending.
    pub replaced: Option<WriteId>,
}

/// Outcome of a failed delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptFailure {
    /// The failed write was already replaced by a newer one; nothing counted.
    Stale,
    /// The attempt was counted; carries the new attempt total.
    Counted(u32),
}

/// Pending writes keyed by record key, delivered in first-queued order.
///
/// # Invariants
///
/// - At most one pending write per key (later writes coalesce)
/// - At most one delivery in flight per key
/// - Acknowledged or abandoned writes are removed
#[derive(Debug, Default)]
pub struct PendingQueue {
    order: VecDeque<String>,
    entries: HashMap<String, PendingWrite>,
}

impl PendingQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a write under a fresh identifier.
    pub fn enqueue(&mut self, key: &str, payload: Payload) -> Enqueued {
        self.enqueue_with_id(key, payload, Uuid::new_v4())
    }

    /// Queues a write, coalescing with any pending write for the same key.
    ///
    /// A coalesced write keeps the in-flight marker of its predecessor so
    /// the newer payload is only sent after the older delivery settles.
    pub fn enqueue_with_id(&mut self, key: &str, payload: Payload, write_id: WriteId) -> Enqueued {
        if let Some(entry) = self.entries.get_mut(key) {
            let replaced = entry.write_id;
            entry.superseded.push(replaced);
            if entry.superseded.len() > MAX_SUPERSEDED {
                entry.superseded.remove(0);
            }
            entry.write_id = write_id;
            entry.payload = payload;
            entry.attempts = 0;
            entry.retry_at = None;
            return Enqueued {
                write_id: entry.write_id,
                replaced: Some(replaced),
            };
        }

        let entry = PendingWrite::new(key.to_string(), payload, write_id);
        self.order.push_back(key.to_string());
        self.entries.insert(key.to_string(), entry);
        Enqueued {
            write_id,
            replaced: None,
        }
    }

    /// Returns the pending write for a key.
    pub fn get(&self, key: &str) -> Option<&PendingWrite> {
        self.entries.get(key)
    }

    /// Removes and returns the pending write for a key.
    pub fn remove(&mut self, key: &str) -> Option<PendingWrite> {
        let entry = self.entries.remove(key)?;
        self.order.retain(|k| k != key);
        Some(entry)
    }

    /// Takes up to `limit` writes that are ready to send and marks them in flight.
    pub fn take_ready(&mut self, now: Instant, limit: usize) -> Vec<WriteRequest> {
        let mut batch = Vec::new();
        for key in &self.order {
            if batch.len() >= limit {
                break;
            }
            if let Some(entry) = self.entries.get_mut(key) {
                if entry.is_ready(now) {
                    entry.in_flight = Some(entry.write_id);
                    batch.push(WriteRequest {
                        key: entry.key.clone(),
                        payload: entry.payload.clone(),
                        write_id: entry.write_id,
                    });
                }
            }
        }
        batch
    }

    /// Returns the earliest scheduled retry among writes not in flight.
    ///
    /// `None` means nothing is waiting on a backoff delay.
    pub fn next_retry_at(&self) -> Option<Instant> {
        self.entries
            .values()
            .filter(|e| e.in_flight.is_none())
            .filter_map(|e| e.retry_at)
            .min()
    }

    /// Returns true if some write can be sent right now.
    pub fn has_ready(&self, now: Instant) -> bool {
        self.entries.values().any(|e| e.is_ready(now))
    }

    /// Clears the in-flight marker left by delivering `write_id`.
    pub fn settle(&mut self, key: &str, write_id: WriteId) {
        if let Some(entry) = self.entries.get_mut(key) {
            if entry.in_flight == Some(write_id) {
                entry.in_flight = None;
            }
        }
    }

    /// Records a failed delivery of `write_id` and schedules the next attempt.
    pub fn record_failure(
        &mut self,
        key: &str,
        write_id: WriteId,
        retry_at: Instant,
    ) -> AttemptFailure {
        self.settle(key, write_id);
        match self.entries.get_mut(key) {
            Some(entry) if entry.write_id == write_id => {
                entry.attempts += 1;
                entry.retry_at = Some(retry_at);
                AttemptFailure::Counted(entry.attempts)
            }
            _ => AttemptFailure::Stale,
        }
    }

    /// Returns the number of pending writes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes every pending write, in queue order.
    pub fn drain(&mut self) -> Vec<PendingWrite> {
        let mut drained = Vec::with_capacity(self.entries.len());
        for key in self.order.drain(..) {
            if let Some(entry) = self.entries.remove(&key) {
                drained.push(entry);
            }
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn enqueue_assigns_distinct_ids() {
        let mut queue = PendingQueue::new();
        let a = queue.enqueue("a", json!(1));
        let b = queue.enqueue("b", json!(2));
        assert_ne!(a.write_id, b.write_id);
        assert_eq!(a.replaced, None);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn same_key_coalesces() {
        let mut queue = PendingQueue::new();
        let first = queue.enqueue("a", json!(1));
        let second = queue.enqueue("a", json!(2));

        assert_eq!(queue.len(), 1);
        assert_eq!(second.replaced, Some(first.write_id));

        let entry = queue.get("a").unwrap();
        assert_eq!(entry.payload, json!(2));
        assert!(entry.is_superseded(&first.write_id));
        assert!(!entry.is_superseded(&second.write_id));
    }

    #[test]
    fn take_ready_marks_in_flight() {
        let mut queue = PendingQueue::new();
        let now = Instant::now();
        queue.enqueue("a", json!(1));
        queue.enqueue("b", json!(2));
        queue.enqueue("c", json!(3));

        let batch = queue.take_ready(now, 2);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].key, "a");
        assert_eq!(batch[1].key, "b");

        // In-flight writes are not handed out twice.
        let rest = queue.take_ready(now, 10);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].key, "c");
        assert!(!queue.has_ready(now));
    }

    #[test]
    fn coalesced_write_waits_for_in_flight() {
        let mut queue = PendingQueue::new();
        let now = Instant::now();
        let first = queue.enqueue("a", json!(1));
        assert_eq!(queue.take_ready(now, 10).len(), 1);

        queue.enqueue("a", json!(2));
        assert!(queue.take_ready(now, 10).is_empty());

        queue.settle("a", first.write_id);
        let batch = queue.take_ready(now, 10);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload, json!(2));
    }

    #[test]
    fn failure_schedules_retry() {
        let mut queue = PendingQueue::new();
        let now = Instant::now();
        let write = queue.enqueue("a", json!(1));
        queue.take_ready(now, 10);

        let retry_at = now + Duration::from_millis(200);
        assert_eq!(
            queue.record_failure("a", write.write_id, retry_at),
            AttemptFailure::Counted(1)
        );
        assert!(!queue.has_ready(now));
        assert_eq!(queue.next_retry_at(), Some(retry_at));
        assert!(queue.has_ready(retry_at));
    }

    #[test]
    fn failure_of_replaced_write_is_not_counted() {
        let mut queue = PendingQueue::new();
        let now = Instant::now();
        let first = queue.enqueue("a", json!(1));
        queue.take_ready(now, 10);
        queue.enqueue("a", json!(2));

        let outcome = queue.record_failure("a", first.write_id, now + Duration::from_secs(1));
        assert_eq!(outcome, AttemptFailure::Stale);
        assert_eq!(queue.get("a").unwrap().attempts, 0);
        // The newer write is immediately sendable.
        assert!(queue.has_ready(now));
    }

    #[test]
    fn drain_preserves_order() {
        let mut queue = PendingQueue::new();
        queue.enqueue("b", json!(1));
        queue.enqueue("a", json!(2));
        let drained = queue.drain();
        assert_eq!(drained[0].key, "b");
        assert_eq!(drained[1].key, "a");
        assert!(queue.is_empty());
    }
}
