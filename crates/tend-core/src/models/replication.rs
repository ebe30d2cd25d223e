//! Messages exchanged between replicas

use serde::{Deserialize, Serialize};

use super::{Checkpoint, Todo};

/// A bounded batch returned by the pull exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullBatch {
    pub documents: Vec<Todo>,
    pub checkpoint: Checkpoint,
}

impl PullBatch {
    /// An empty batch that leaves the cursor where it was
    #[must_use]
    pub const fn empty(checkpoint: Checkpoint) -> Self {
        Self {
            documents: Vec::new(),
            checkpoint,
        }
    }
}

/// One proposed write in a push
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRow {
    pub new_document_state: Todo,
    #[serde(default)]
    pub assumed_master_state: Option<Todo>,
}

/// Documents accepted by a replica, fanned out to live subscribers.
///
/// `checkpoint` is `None` when the event carries no positional information;
/// receivers apply the documents and keep their cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationEvent {
    pub documents: Vec<Todo>,
    pub checkpoint: Option<Checkpoint>,
}

impl ReplicationEvent {
    /// An event for a single write, positioned at that write
    #[must_use]
    pub fn single(todo: Todo) -> Self {
        let checkpoint = Some(Checkpoint::of(&todo));
        Self {
            documents: vec![todo],
            checkpoint,
        }
    }

    /// The same documents without positional information
    #[must_use]
    pub fn without_checkpoint(self) -> Self {
        Self {
            documents: self.documents,
            checkpoint: None,
        }
    }
}

/// What a pull-following subscriber receives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullStreamItem {
    Event(ReplicationEvent),
    /// Events were lost; re-pull from the zero checkpoint
    Resync,
}

/// Wire value of the resync marker on the live stream
pub const RESYNC_MARKER: &str = "RESYNC";

impl PullStreamItem {
    /// Encode as the `data:` payload of a stream frame
    pub fn to_json(&self) -> serde_json::Result<String> {
        match self {
            Self::Event(event) => serde_json::to_string(event),
            Self::Resync => serde_json::to_string(RESYNC_MARKER),
        }
    }

    /// Decode a `data:` payload
    pub fn from_json(data: &str) -> serde_json::Result<Self> {
        let value: serde_json::Value = serde_json::from_str(data)?;
        if value.as_str() == Some(RESYNC_MARKER) {
            return Ok(Self::Resync);
        }
        serde_json::from_value(value).map(Self::Event)
    }
}
