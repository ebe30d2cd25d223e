//! Checkpoint cursor over the replication order

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use super::Todo;

/// A resume position in the replication order.
///
/// Records are totally ordered by `last_change` ascending, then `id`
/// ascending. A checkpoint `(updated_at, id)` means every record at or before
/// that position has been seen.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub id: String,
    pub updated_at: i64,
}

impl Checkpoint {
    pub fn new(updated_at: i64, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            updated_at,
        }
    }

    /// The position before every record
    #[must_use]
    pub fn zero() -> Self {
        Self::default()
    }

    /// The position of the given record
    #[must_use]
    pub fn of(todo: &Todo) -> Self {
        Self::new(todo.last_change, todo.id.as_str())
    }

    /// Whether `todo` lies strictly after this position.
    ///
    /// Equal timestamps fall back to the id so that several records written
    /// in the same millisecond are neither skipped nor delivered twice.
    #[must_use]
    pub fn precedes(&self, todo: &Todo) -> bool {
        todo.last_change > self.updated_at
            || (todo.last_change == self.updated_at && todo.id.as_str() > self.id.as_str())
    }
}

impl Ord for Checkpoint {
    fn cmp(&self, other: &Self) -> Ordering {
        self.updated_at
            .cmp(&other.updated_at)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for Checkpoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Compare two records by replication order.
pub fn replication_order(a: &Todo, b: &Todo) -> Ordering {
    a.last_change
        .cmp(&b.last_change)
        .then_with(|| a.id.cmp(&b.id))
}
