//! Conflict resolution between two versions of a todo

use crate::models::Todo;

/// Picks the winner between a local state and the state held by a master.
///
/// One handler is shared by every replication path of a replica, so a
/// record arriving over HTTP or over the mesh is resolved the same way.
pub trait ConflictHandler: Send + Sync {
    /// Whether two states are the same (duplicate delivery, no conflict)
    fn is_equal(&self, a: &Todo, b: &Todo) -> bool;

    /// The state both sides should converge to
    fn resolve(&self, ours: &Todo, theirs: &Todo) -> Todo;
}

/// Last-write-wins on `last_change`; ties go to `theirs`.
///
/// Wall clocks of independent replicas are used as the logical clock, so a
/// replica with a fast clock wins more often.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriteWins;

impl ConflictHandler for LastWriteWins {
    fn is_equal(&self, a: &Todo, b: &Todo) -> bool {
        a == b
    }

    fn resolve(&self, ours: &Todo, theirs: &Todo) -> Todo {
        if ours.last_change > theirs.last_change {
            ours.clone()
        } else {
            theirs.clone()
        }
    }
}
