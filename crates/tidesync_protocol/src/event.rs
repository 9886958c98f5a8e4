//! Messages exchanged with the remote store.

use crate::pending::WriteId;
use crate::Payload;
use serde::{Deserialize, Serialize};

/// A push update received on a remote subscription.
///
/// `write_id` carries the provenance of the write that produced `version`,
/// which lets the originating client recognise its own acknowledgment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEvent {
    /// Record key.
    pub key: String,
    /// Version assigned by the remote store.
    pub version: u64,
    /// New payload. `None` for deletions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
    /// Whether the key was deleted.
    #[serde(default)]
    pub deleted: bool,
    /// Identifier of the client write that produced this version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_id: Option<WriteId>,
}

impl RemoteEvent {
    /// Creates an upsert event.
    pub fn upsert(key: impl Into<String>, version: u64, payload: Payload) -> Self {
        Self {
            key: key.into(),
            version,
            payload: Some(payload),
            deleted: false,
            write_id: None,
        }
    }

    /// Creates a deletion event.
    pub fn delete(key: impl Into<String>, version: u64) -> Self {
        Self {
            key: key.into(),
            version,
            payload: None,
            deleted: true,
            write_id: None,
        }
    }

    /// Tags the event with the write that produced it.
    pub fn with_write_id(mut self, write_id: WriteId) -> Self {
        self.write_id = Some(write_id);
        self
    }

    /// Builds the event equivalent of a direct write acknowledgment.
    ///
    /// The remote stored exactly the payload that was sent, at the acked version.
    pub fn from_ack(ack: &WriteAck, sent: &WriteRequest) -> Self {
        Self {
            key: ack.key.clone(),
            version: ack.version,
            payload: Some(sent.payload.clone()),
            deleted: false,
            write_id: Some(ack.write_id),
        }
    }
}

/// A local write sent to the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteRequest {
    /// Record key.
    pub key: String,
    /// Payload to store.
    pub payload: Payload,
    /// Client-generated identifier echoed back in events and acks.
    pub write_id: WriteId,
}

/// Version assignment returned by the remote store for a write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteAck {
    /// Record key.
    pub key: String,
    /// Assigned version.
    pub version: u64,
    /// Identifier of the acknowledged write.
    pub write_id: WriteId,
}
