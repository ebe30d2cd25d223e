//! Todo model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Maximum length of a todo id in bytes
pub const MAX_ID_LEN: usize = 20;

/// Length of freshly generated ids
const GENERATED_ID_LEN: usize = 16;

/// A unique identifier for a todo.
///
/// Ids are opaque strings of at most [`MAX_ID_LEN`] bytes. They are compared
/// bytewise, which is the secondary key of the replication order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TodoId(String);

impl TodoId {
    /// Create a new random todo ID
    #[must_use]
    pub fn new() -> Self {
        let mut token = Uuid::new_v4().simple().to_string();
        token.truncate(GENERATED_ID_LEN);
        Self(token)
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TodoId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TodoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TodoId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::InvalidInput("todo id must not be empty".into()));
        }
        if s.len() > MAX_ID_LEN {
            return Err(Error::InvalidInput(format!(
                "todo id must be at most {MAX_ID_LEN} bytes"
            )));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<&str> for TodoId {
    /// Wraps the string without validation; validators check ids of untrusted records.
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Completion state of a todo
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TodoState {
    /// Still to do
    #[default]
    Open,
    /// Completed
    Done,
}

impl TodoState {
    /// The other state
    #[must_use]
    pub const fn toggled(self) -> Self {
        match self {
            Self::Open => Self::Done,
            Self::Done => Self::Open,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Done => "done",
        }
    }
}

impl FromStr for TodoState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "open" => Ok(Self::Open),
            "done" => Ok(Self::Done),
            other => Err(Error::InvalidInput(format!("unknown todo state: {other}"))),
        }
    }
}

/// A todo record, the unit of replication
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Todo {
    /// Primary key, immutable
    pub id: TodoId,
    /// Display text
    pub name: String,
    /// Open or done
    pub state: TodoState,
    /// Timestamp of the last mutation (Unix ms); logical clock and sort key
    pub last_change: i64,
    /// Tombstone flag, replicated like any other field
    #[serde(rename = "_deleted", default, skip_serializing_if = "is_false")]
    pub deleted: bool,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
const fn is_false(value: &bool) -> bool {
    !*value
}

impl Todo {
    /// Create a new open todo stamped with the current time
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: TodoId::new(),
            name: name.into(),
            state: TodoState::Open,
            last_change: now_millis(),
            deleted: false,
        }
    }

    /// Whether this record is visible to users
    #[must_use]
    pub const fn is_visible(&self) -> bool {
        !self.deleted
    }

    /// Apply a local edit, reassigning `last_change`.
    ///
    /// The new stamp is strictly greater than the previous one even when the
    /// wall clock has not advanced.
    #[must_use]
    pub fn edited(&self, edit: impl FnOnce(&mut Self)) -> Self {
        let mut next = self.clone();
        edit(&mut next);
        next.last_change = now_millis().max(self.last_change.saturating_add(1));
        next
    }
}

/// Current Unix timestamp in milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_todo_id_unique_and_short() {
        let id1 = TodoId::new();
        let id2 = TodoId::new();
        assert_ne!(id1, id2);
        assert!(id1.as_str().len() <= MAX_ID_LEN);
    }

    #[test]
    fn test_todo_id_parse_rejects_long_ids() {
        assert!("t1".parse::<TodoId>().is_ok());
        assert!("".parse::<TodoId>().is_err());
        assert!("x".repeat(21).parse::<TodoId>().is_err());
    }

    #[test]
    fn test_todo_new() {
        let todo = Todo::new("buy milk");
        assert_eq!(todo.name, "buy milk");
        assert_eq!(todo.state, TodoState::Open);
        assert!(todo.last_change > 0);
        assert!(!todo.deleted);
    }

    #[test]
    fn test_edit_advances_clock_past_future_stamp() {
        let mut todo = Todo::new("a");
        todo.last_change = now_millis() + 60_000;
        let edited = todo.edited(|t| t.state = t.state.toggled());
        assert_eq!(edited.state, TodoState::Done);
        assert_eq!(edited.last_change, todo.last_change + 1);
    }

    #[test]
    fn test_wire_format() {
        let todo = Todo {
            id: "t1".into(),
            name: "buy milk".to_string(),
            state: TodoState::Open,
            last_change: 100,
            deleted: false,
        };
        let json = serde_json::to_value(&todo).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"id": "t1", "name": "buy milk", "state": "open", "lastChange": 100})
        );

        let tombstone: Todo = serde_json::from_value(serde_json::json!({
            "id": "t1", "name": "x", "state": "done", "lastChange": 5, "_deleted": true
        }))
        .unwrap();
        assert!(tombstone.deleted);
        assert_eq!(tombstone.state, TodoState::Done);
    }
}
