//! Pull and push exchange over a single store

use crate::db::TodoStore;
use crate::error::{Error, Result};
use crate::models::{replication_order, Checkpoint, PullBatch, PushRow, ReplicationEvent, Todo};

/// Default number of records per pull
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Serve a pull: the next `batch_size` records after `checkpoint`.
///
/// An empty batch echoes the input checkpoint, so polling at the head of the
/// stream is a no-op.
pub fn pull(
    store: &dyn TodoStore,
    checkpoint: &Checkpoint,
    batch_size: usize,
) -> Result<PullBatch> {
    let batch_size = if batch_size == 0 {
        DEFAULT_BATCH_SIZE
    } else {
        batch_size
    };
    let documents = store.changes_since(checkpoint, batch_size)?;
    if !in_replication_order(checkpoint, &documents) {
        return Err(Error::Database(
            "store returned records out of replication order".to_string(),
        ));
    }
    let checkpoint = documents
        .last()
        .map_or_else(|| checkpoint.clone(), Checkpoint::of);
    Ok(PullBatch {
        documents,
        checkpoint,
    })
}

/// Every record lies after `checkpoint` and strictly after the one before it.
fn in_replication_order(checkpoint: &Checkpoint, documents: &[Todo]) -> bool {
    documents.first().is_none_or(|first| checkpoint.precedes(first))
        && documents
            .windows(2)
            .all(|pair| replication_order(&pair[0], &pair[1]).is_lt())
}

/// Result of applying a push batch
#[derive(Debug, Default)]
pub struct PushOutcome {
    /// Current master states of the rows that were not applied, in input order
    pub conflicts: Vec<Todo>,
    /// Applied writes, present when at least one row was applied
    pub event: Option<ReplicationEvent>,
}

/// Apply a push batch, row by row, in submission order.
///
/// A row conflicts when the record exists and the pusher either assumed it
/// did not or assumed a different `last_change`. Conflicting rows leave the
/// store untouched; their current state is reported back.
pub fn push(store: &mut dyn TodoStore, rows: &[PushRow]) -> Result<PushOutcome> {
    let mut conflicts = Vec::new();
    let mut applied = Vec::new();

    for row in rows {
        let new_state = &row.new_document_state;
        let existing = store.get(&new_state.id)?;

        if let Some(existing) = existing {
            let matches_base = row
                .assumed_master_state
                .as_ref()
                .is_some_and(|assumed| assumed.last_change == existing.last_change);
            if !matches_base {
                conflicts.push(existing);
                continue;
            }
        }

        store.put(new_state)?;
        applied.push(new_state.clone());
    }

    let event = applied.last().map(Checkpoint::of).map(|checkpoint| ReplicationEvent {
        documents: applied,
        checkpoint: Some(checkpoint),
    });

    Ok(PushOutcome { conflicts, event })
}
