//! Todo store trait and its `SQLite` implementation

use crate::error::Result;
use crate::models::{Checkpoint, PushRow, Todo, TodoId};
use rusqlite::{params, OptionalExtension};

use super::Database;

/// Storage operations for one replica.
///
/// A store is a plain keyed record set with a range query over the
/// replication order. It does no stamping, validation, or notification;
/// those belong to the [`Replica`](crate::services::Replica) wrapping it.
pub trait TodoStore: Send {
    /// Get a todo by ID, tombstones included
    fn get(&self, id: &TodoId) -> Result<Option<Todo>>;

    /// Insert or replace a todo
    fn put(&mut self, todo: &Todo) -> Result<()>;

    /// Records strictly after `checkpoint` in replication order, at most `limit`
    fn changes_since(&self, checkpoint: &Checkpoint, limit: usize) -> Result<Vec<Todo>>;

    /// Visible todos, open first, most recently changed first
    fn list(&self) -> Result<Vec<Todo>>;

    /// Number of records, tombstones included
    fn count(&self) -> Result<usize>;

    /// Last pull checkpoint stored for a replication
    fn checkpoint(&self, identifier: &str) -> Result<Option<Checkpoint>>;

    fn set_checkpoint(&mut self, identifier: &str, checkpoint: &Checkpoint) -> Result<()>;

    /// Last state of `id` known to be held by the replication's master
    fn master_state(&self, identifier: &str, id: &TodoId) -> Result<Option<Todo>>;

    fn set_master_state(&mut self, identifier: &str, todo: &Todo) -> Result<()>;

    /// Forget the checkpoint and every master state of a replication
    fn clear_replication(&mut self, identifier: &str) -> Result<()>;

    /// Local records that differ from their known master state, in
    /// replication order, as push rows
    fn pending(&self, identifier: &str, limit: usize) -> Result<Vec<PushRow>>;
}

/// `SQLite` implementation of `TodoStore`
pub struct SqliteTodoStore {
    db: Database,
}

impl SqliteTodoStore {
    pub const fn new(db: Database) -> Self {
        Self { db }
    }

    /// Parse a todo from the first five columns of a row
    fn parse_todo(row: &rusqlite::Row<'_>) -> rusqlite::Result<Todo> {
        Self::parse_todo_at(row, 0)
    }

    fn parse_todo_at(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<Todo> {
        let id: String = row.get(offset)?;
        let state: String = row.get(offset + 2)?;
        Ok(Todo {
            id: TodoId::from(id.as_str()),
            name: row.get(offset + 1)?,
            state: state.parse().map_err(|_| {
                rusqlite::Error::InvalidColumnType(
                    offset + 2,
                    "state".to_string(),
                    rusqlite::types::Type::Text,
                )
            })?,
            last_change: row.get(offset + 3)?,
            deleted: row.get::<_, i32>(offset + 4)? != 0,
        })
    }
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

impl TodoStore for SqliteTodoStore {
    fn get(&self, id: &TodoId) -> Result<Option<Todo>> {
        let todo = self
            .db
            .connection()
            .query_row(
                "SELECT id, name, state, last_change, deleted FROM todos WHERE id = ?",
                params![id.as_str()],
                Self::parse_todo,
            )
            .optional()?;
        Ok(todo)
    }

    fn put(&mut self, todo: &Todo) -> Result<()> {
        self.db.connection().execute(
            "INSERT INTO todos (id, name, state, last_change, deleted) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                state = excluded.state,
                last_change = excluded.last_change,
                deleted = excluded.deleted",
            params![
                todo.id.as_str(),
                todo.name,
                todo.state.as_str(),
                todo.last_change,
                i32::from(todo.deleted)
            ],
        )?;
        Ok(())
    }

    fn changes_since(&self, checkpoint: &Checkpoint, limit: usize) -> Result<Vec<Todo>> {
        let mut stmt = self.db.connection().prepare(
            "SELECT id, name, state, last_change, deleted
             FROM todos
             WHERE last_change > ?1 OR (last_change = ?1 AND id > ?2)
             ORDER BY last_change ASC, id ASC
             LIMIT ?3",
        )?;

        let todos = stmt
            .query_map(
                params![checkpoint.updated_at, checkpoint.id, sql_limit(limit)],
                Self::parse_todo,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(todos)
    }

    fn list(&self) -> Result<Vec<Todo>> {
        let mut stmt = self.db.connection().prepare(
            "SELECT id, name, state, last_change, deleted
             FROM todos
             WHERE deleted = 0
             ORDER BY state DESC, last_change DESC",
        )?;

        let todos = stmt
            .query_map([], Self::parse_todo)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(todos)
    }

    fn count(&self) -> Result<usize> {
        let count: i64 = self
            .db
            .connection()
            .query_row("SELECT COUNT(*) FROM todos", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    fn checkpoint(&self, identifier: &str) -> Result<Option<Checkpoint>> {
        let checkpoint = self
            .db
            .connection()
            .query_row(
                "SELECT updated_at, id FROM replication_checkpoints WHERE identifier = ?",
                params![identifier],
                |row| Ok(Checkpoint::new(row.get(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        Ok(checkpoint)
    }

    fn set_checkpoint(&mut self, identifier: &str, checkpoint: &Checkpoint) -> Result<()> {
        self.db.connection().execute(
            "INSERT INTO replication_checkpoints (identifier, updated_at, id) VALUES (?, ?, ?)
             ON CONFLICT(identifier) DO UPDATE SET
                updated_at = excluded.updated_at,
                id = excluded.id",
            params![identifier, checkpoint.updated_at, checkpoint.id],
        )?;
        Ok(())
    }

    fn master_state(&self, identifier: &str, id: &TodoId) -> Result<Option<Todo>> {
        let todo = self
            .db
            .connection()
            .query_row(
                "SELECT id, name, state, last_change, deleted
                 FROM replication_master_states
                 WHERE identifier = ? AND id = ?",
                params![identifier, id.as_str()],
                Self::parse_todo,
            )
            .optional()?;
        Ok(todo)
    }

    fn set_master_state(&mut self, identifier: &str, todo: &Todo) -> Result<()> {
        self.db.connection().execute(
            "INSERT INTO replication_master_states
                (identifier, id, name, state, last_change, deleted)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(identifier, id) DO UPDATE SET
                name = excluded.name,
                state = excluded.state,
                last_change = excluded.last_change,
                deleted = excluded.deleted",
            params![
                identifier,
                todo.id.as_str(),
                todo.name,
                todo.state.as_str(),
                todo.last_change,
                i32::from(todo.deleted)
            ],
        )?;
        Ok(())
    }

    fn clear_replication(&mut self, identifier: &str) -> Result<()> {
        let conn = self.db.connection();
        conn.execute(
            "DELETE FROM replication_master_states WHERE identifier = ?",
            params![identifier],
        )?;
        conn.execute(
            "DELETE FROM replication_checkpoints WHERE identifier = ?",
            params![identifier],
        )?;
        Ok(())
    }

    fn pending(&self, identifier: &str, limit: usize) -> Result<Vec<PushRow>> {
        let mut stmt = self.db.connection().prepare(
            "SELECT t.id, t.name, t.state, t.last_change, t.deleted,
                    m.id, m.name, m.state, m.last_change, m.deleted
             FROM todos t
             LEFT JOIN replication_master_states m
                ON m.identifier = ?1 AND m.id = t.id
             WHERE m.id IS NULL
                OR m.name != t.name
                OR m.state != t.state
                OR m.last_change != t.last_change
                OR m.deleted != t.deleted
             ORDER BY t.last_change ASC, t.id ASC
             LIMIT ?2",
        )?;

        let rows = stmt
            .query_map(params![identifier, sql_limit(limit)], |row| {
                let new_document_state = Self::parse_todo_at(row, 0)?;
                let master_id: Option<String> = row.get(5)?;
                let assumed_master_state = match master_id {
                    Some(_) => Some(Self::parse_todo_at(row, 5)?),
                    None => None,
                };
                Ok(PushRow {
                    new_document_state,
                    assumed_master_state,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows)
    }
}
