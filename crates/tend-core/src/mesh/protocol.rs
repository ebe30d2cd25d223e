//! JSON frames exchanged between mesh peers

use serde::{Deserialize, Serialize};

use crate::models::{Checkpoint, PullBatch, PushRow, ReplicationEvent, Todo};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MeshMessage {
    Request { id: u64, request: MeshRequest },
    Response { id: u64, response: MeshResponse },
    /// A write accepted by the sender. Forwarded events carry no checkpoint.
    Event { event: ReplicationEvent },
    /// The sender dropped events for this peer; pull again from zero
    Resync,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum MeshRequest {
    Pull {
        checkpoint: Checkpoint,
        #[serde(rename = "batchSize")]
        batch_size: usize,
    },
    Push {
        rows: Vec<PushRow>,
    },
    /// Start forwarding live events to the requester
    Subscribe,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum MeshResponse {
    Pull { batch: PullBatch },
    Push { conflicts: Vec<Todo> },
    Subscribed,
    Error { message: String },
}

impl MeshMessage {
    pub fn to_frame(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_frame(frame: &str) -> serde_json::Result<Self> {
        serde_json::from_str(frame)
    }
}
