//! In-memory todo store

use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;

use crate::error::Result;
use crate::models::{Checkpoint, PushRow, Todo, TodoId};

use super::TodoStore;

#[derive(Debug, Default)]
struct ReplicationMeta {
    checkpoint: Option<Checkpoint>,
    master_states: HashMap<TodoId, Todo>,
}

/// Volatile store kept in replication order.
///
/// Used by the server when no database path is configured, and by tests.
#[derive(Debug, Default)]
pub struct MemoryTodoStore {
    todos: HashMap<TodoId, Todo>,
    order: BTreeSet<(i64, TodoId)>,
    meta: HashMap<String, ReplicationMeta>,
}

impl MemoryTodoStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn ordered(&self) -> impl Iterator<Item = &Todo> {
        self.order.iter().filter_map(|(_, id)| self.todos.get(id))
    }
}

impl TodoStore for MemoryTodoStore {
    fn get(&self, id: &TodoId) -> Result<Option<Todo>> {
        Ok(self.todos.get(id).cloned())
    }

    fn put(&mut self, todo: &Todo) -> Result<()> {
        if let Some(previous) = self.todos.insert(todo.id.clone(), todo.clone()) {
            self.order.remove(&(previous.last_change, previous.id));
        }
        self.order.insert((todo.last_change, todo.id.clone()));
        Ok(())
    }

    fn changes_since(&self, checkpoint: &Checkpoint, limit: usize) -> Result<Vec<Todo>> {
        let start = (
            checkpoint.updated_at,
            TodoId::from(checkpoint.id.as_str()),
        );
        Ok(self
            .order
            .range((Bound::Excluded(start), Bound::Unbounded))
            .filter_map(|(_, id)| self.todos.get(id))
            .take(limit)
            .cloned()
            .collect())
    }

    fn list(&self) -> Result<Vec<Todo>> {
        let mut todos = self
            .todos
            .values()
            .filter(|todo| todo.is_visible())
            .cloned()
            .collect::<Vec<_>>();
        todos.sort_by(|a, b| {
            b.state
                .as_str()
                .cmp(a.state.as_str())
                .then_with(|| b.last_change.cmp(&a.last_change))
        });
        Ok(todos)
    }

    fn count(&self) -> Result<usize> {
        Ok(self.todos.len())
    }

    fn checkpoint(&self, identifier: &str) -> Result<Option<Checkpoint>> {
        Ok(self
            .meta
            .get(identifier)
            .and_then(|meta| meta.checkpoint.clone()))
    }

    fn set_checkpoint(&mut self, identifier: &str, checkpoint: &Checkpoint) -> Result<()> {
        self.meta
            .entry(identifier.to_string())
            .or_default()
            .checkpoint = Some(checkpoint.clone());
        Ok(())
    }

    fn master_state(&self, identifier: &str, id: &TodoId) -> Result<Option<Todo>> {
        Ok(self
            .meta
            .get(identifier)
            .and_then(|meta| meta.master_states.get(id).cloned()))
    }

    fn set_master_state(&mut self, identifier: &str, todo: &Todo) -> Result<()> {
        self.meta
            .entry(identifier.to_string())
            .or_default()
            .master_states
            .insert(todo.id.clone(), todo.clone());
        Ok(())
    }

    fn clear_replication(&mut self, identifier: &str) -> Result<()> {
        self.meta.remove(identifier);
        Ok(())
    }

    fn pending(&self, identifier: &str, limit: usize) -> Result<Vec<PushRow>> {
        let masters = self.meta.get(identifier).map(|meta| &meta.master_states);
        Ok(self
            .ordered()
            .filter_map(|todo| {
                let master = masters.and_then(|m| m.get(&todo.id));
                (master != Some(todo)).then(|| PushRow {
                    new_document_state: todo.clone(),
                    assumed_master_state: master.cloned(),
                })
            })
            .take(limit)
            .collect())
    }
}
