//! Data models for tend

mod checkpoint;
mod replication;
mod todo;
mod validation;

pub use checkpoint::{replication_order, Checkpoint};
pub use replication::{PullBatch, PullStreamItem, PushRow, ReplicationEvent, RESYNC_MARKER};
pub use todo::{now_millis, Todo, TodoId, TodoState, MAX_ID_LEN};
pub use validation::{SchemaValidator, TodoValidator, MAX_LAST_CHANGE};
