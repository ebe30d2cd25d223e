//! Shared replica service used by the server, the client, and mesh peers.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::db::{Database, MemoryTodoStore, SqliteTodoStore, TodoStore};
use crate::models::{
    Checkpoint, PullBatch, PushRow, ReplicationEvent, SchemaValidator, Todo, TodoId, TodoState,
    TodoValidator,
};
use crate::replication::exchange;
use crate::replication::{ConflictHandler, LastWriteWins, LiveNotifier, Subscription};
use crate::{Error, Result};

/// One replica of the todo set.
///
/// Every mutation, local or replicated, goes through the single store lock
/// and is published to the live feed while the lock is held, so subscribers
/// observe writes in the order they were applied.
#[derive(Clone)]
pub struct Replica {
    store: Arc<Mutex<Box<dyn TodoStore>>>,
    notifier: LiveNotifier,
    conflicts: Arc<dyn ConflictHandler>,
    validator: Arc<dyn TodoValidator>,
}

impl Replica {
    /// Wrap a store with the default notifier, resolver, and validator.
    pub fn new(store: impl TodoStore + 'static) -> Self {
        Self {
            store: Arc::new(Mutex::new(Box::new(store))),
            notifier: LiveNotifier::default(),
            conflicts: Arc::new(LastWriteWins),
            validator: Arc::new(SchemaValidator),
        }
    }

    /// A volatile replica.
    pub fn in_memory() -> Self {
        Self::new(MemoryTodoStore::new())
    }

    /// A replica persisted in a `SQLite` file at `path`.
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::open(path)?;
        Ok(Self::new(SqliteTodoStore::new(db)))
    }

    /// Use a live feed with the given per-subscriber capacity.
    #[must_use]
    pub fn with_subscriber_capacity(mut self, capacity: usize) -> Self {
        self.notifier = LiveNotifier::new(capacity);
        self
    }

    #[must_use]
    pub fn with_conflict_handler(mut self, handler: impl ConflictHandler + 'static) -> Self {
        self.conflicts = Arc::new(handler);
        self
    }

    #[must_use]
    pub fn with_validator(mut self, validator: impl TodoValidator + 'static) -> Self {
        self.validator = Arc::new(validator);
        self
    }

    /// Close the live feed. Writes are refused afterwards.
    pub fn shutdown(&self) {
        tracing::info!("Shutting down replica");
        self.notifier.close();
    }

    pub fn is_closed(&self) -> bool {
        self.notifier.is_closed()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    // ----------------------------------------------------------------------
    // Local edits
    // ----------------------------------------------------------------------

    /// Create a new open todo.
    pub async fn insert(&self, name: &str) -> Result<Todo> {
        let name = normalize_name(name)?;
        self.ensure_open()?;
        let todo = Todo::new(name);
        self.validator.validate(&todo)?;

        let mut store = self.store.lock().await;
        store.put(&todo)?;
        self.notifier.publish(&ReplicationEvent::single(todo.clone()));
        tracing::debug!(id = %todo.id, "Inserted todo");
        Ok(todo)
    }

    /// Change a todo's name.
    pub async fn rename(&self, id: &TodoId, name: &str) -> Result<Todo> {
        let name = normalize_name(name)?;
        self.edit(id, |todo| todo.name = name).await
    }

    /// Flip a todo between open and done.
    pub async fn toggle(&self, id: &TodoId) -> Result<Todo> {
        self.edit(id, |todo| todo.state = todo.state.toggled()).await
    }

    /// Tombstone a todo.
    pub async fn delete(&self, id: &TodoId) -> Result<Todo> {
        self.edit(id, |todo| todo.deleted = true).await
    }

    /// Tombstone every done todo, returning the tombstones.
    pub async fn clear_completed(&self) -> Result<Vec<Todo>> {
        self.ensure_open()?;
        let mut store = self.store.lock().await;
        let done = store
            .list()?
            .into_iter()
            .filter(|todo| todo.state == TodoState::Done)
            .collect::<Vec<_>>();

        let mut removed = Vec::with_capacity(done.len());
        for todo in done {
            let tombstone = todo.edited(|t| t.deleted = true);
            store.put(&tombstone)?;
            self.notifier
                .publish(&ReplicationEvent::single(tombstone.clone()));
            removed.push(tombstone);
        }
        Ok(removed)
    }

    async fn edit(&self, id: &TodoId, edit: impl FnOnce(&mut Todo)) -> Result<Todo> {
        self.ensure_open()?;
        let mut store = self.store.lock().await;
        let current = store
            .get(id)?
            .filter(Todo::is_visible)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        let next = current.edited(edit);
        self.validator.validate(&next)?;
        store.put(&next)?;
        self.notifier.publish(&ReplicationEvent::single(next.clone()));
        tracing::debug!(id = %next.id, last_change = next.last_change, "Edited todo");
        Ok(next)
    }

    // ----------------------------------------------------------------------
    // Reads
    // ----------------------------------------------------------------------

    /// Fetch a visible todo by id.
    pub async fn get(&self, id: &TodoId) -> Result<Option<Todo>> {
        let store = self.store.lock().await;
        Ok(store.get(id)?.filter(Todo::is_visible))
    }

    /// Visible todos, open first, newest first.
    pub async fn list(&self) -> Result<Vec<Todo>> {
        let store = self.store.lock().await;
        store.list()
    }

    /// Number of stored records, tombstones included.
    pub async fn count(&self) -> Result<usize> {
        let store = self.store.lock().await;
        store.count()
    }

    // ----------------------------------------------------------------------
    // Serving side of the exchange
    // ----------------------------------------------------------------------

    /// Serve a pull from this replica.
    pub async fn pull(&self, checkpoint: &Checkpoint, batch_size: usize) -> Result<PullBatch> {
        let store = self.store.lock().await;
        exchange::pull(&**store, checkpoint, batch_size)
    }

    /// Apply a push against this replica, returning the conflicts.
    ///
    /// Every row is validated before any row is applied; an invalid row
    /// rejects the whole batch without side effects.
    pub async fn push(&self, rows: &[PushRow]) -> Result<Vec<Todo>> {
        for row in rows {
            self.validator.validate(&row.new_document_state)?;
        }
        self.ensure_open()?;

        let mut store = self.store.lock().await;
        let outcome = exchange::push(&mut **store, rows)?;
        if let Some(event) = &outcome.event {
            self.notifier.publish(event);
        }
        tracing::debug!(
            rows = rows.len(),
            conflicts = outcome.conflicts.len(),
            "Applied push"
        );
        Ok(outcome.conflicts)
    }

    /// Follow writes accepted by this replica.
    pub fn subscribe(&self) -> Subscription {
        self.notifier.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.notifier.subscriber_count()
    }

    // ----------------------------------------------------------------------
    // Pulling side: replication metadata and reconciliation
    // ----------------------------------------------------------------------

    /// Stored pull checkpoint for a replication, zero when none.
    pub async fn checkpoint(&self, identifier: &str) -> Result<Checkpoint> {
        let store = self.store.lock().await;
        Ok(store.checkpoint(identifier)?.unwrap_or_default())
    }

    pub async fn set_checkpoint(&self, identifier: &str, checkpoint: &Checkpoint) -> Result<()> {
        let mut store = self.store.lock().await;
        store.set_checkpoint(identifier, checkpoint)
    }

    /// Drop everything stored about one replication. The next replication
    /// under that identifier starts from the zero checkpoint.
    pub async fn clear_replication(&self, identifier: &str) -> Result<()> {
        let mut store = self.store.lock().await;
        store.clear_replication(identifier)
    }

    /// Local writes not yet acknowledged by the replication's master.
    pub async fn pending(&self, identifier: &str, limit: usize) -> Result<Vec<PushRow>> {
        let store = self.store.lock().await;
        store.pending(identifier, limit)
    }

    /// Apply documents received from a master.
    ///
    /// A document replaces the local record unless the record has a pending
    /// local change, in which case the conflict handler decides. Either way
    /// the document becomes the assumed master state. Returns the number of
    /// local records that changed.
    pub async fn apply_from_master(&self, identifier: &str, documents: &[Todo]) -> Result<usize> {
        self.ensure_open()?;
        let mut store = self.store.lock().await;
        let mut changed = Vec::new();

        for doc in documents {
            if let Err(error) = self.validator.validate(doc) {
                tracing::warn!(%identifier, id = %doc.id, %error, "Skipping invalid document from master");
                continue;
            }

            let local = store.get(&doc.id)?;
            let overwrite = match &local {
                None => true,
                Some(local) if self.conflicts.is_equal(local, doc) => false,
                Some(local) => {
                    let assumed = store.master_state(identifier, &doc.id)?;
                    let has_pending = assumed
                        .as_ref()
                        .is_none_or(|assumed| !self.conflicts.is_equal(assumed, local));
                    if has_pending {
                        let winner = self.conflicts.resolve(local, doc);
                        self.conflicts.is_equal(&winner, doc)
                    } else {
                        true
                    }
                }
            };

            if overwrite {
                store.put(doc)?;
                changed.push(doc.clone());
            }
            store.set_master_state(identifier, doc)?;
        }

        let count = changed.len();
        if !changed.is_empty() {
            self.notifier.publish(&ReplicationEvent {
                documents: changed,
                checkpoint: None,
            });
        }
        Ok(count)
    }

    /// Record the outcome of a push sent to a master.
    ///
    /// Rows absent from `conflicts` were accepted and become the assumed
    /// master state. Each conflict is reconciled through the conflict
    /// handler: when the master wins it overwrites the local record; when
    /// the local record wins it stays pending against the real master state.
    pub async fn confirm_push(
        &self,
        identifier: &str,
        rows: &[PushRow],
        conflicts: &[Todo],
    ) -> Result<()> {
        let rejected: HashMap<&TodoId, &Todo> =
            conflicts.iter().map(|todo| (&todo.id, todo)).collect();

        let mut store = self.store.lock().await;
        let mut changed = Vec::new();

        for row in rows {
            let id = &row.new_document_state.id;
            let Some(master) = rejected.get(id) else {
                store.set_master_state(identifier, &row.new_document_state)?;
                continue;
            };

            let local = store.get(id)?;
            let master_wins = local.as_ref().is_none_or(|local| {
                !self.conflicts.is_equal(local, master)
                    && self
                        .conflicts
                        .is_equal(&self.conflicts.resolve(local, master), master)
            });
            if master_wins {
                store.put(master)?;
                changed.push((*master).clone());
            }
            store.set_master_state(identifier, master)?;
            tracing::debug!(%identifier, %id, master_wins, "Reconciled push conflict");
        }

        if !changed.is_empty() {
            self.notifier.publish(&ReplicationEvent {
                documents: changed,
                checkpoint: None,
            });
        }
        Ok(())
    }
}

fn normalize_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        Err(Error::InvalidInput("todo name cannot be empty".into()))
    } else {
        Ok(name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PullStreamItem;
    use pretty_assertions::assert_eq;

    fn todo(id: &str, name: &str, last_change: i64) -> Todo {
        Todo {
            id: TodoId::from(id),
            name: name.to_string(),
            state: TodoState::Open,
            last_change,
            deleted: false,
        }
    }

    fn row(new_state: Todo, assumed: Option<Todo>) -> PushRow {
        PushRow {
            new_document_state: new_state,
            assumed_master_state: assumed,
        }
    }

    #[tokio::test]
    async fn local_edits_restamp_and_publish() {
        let replica = Replica::in_memory();
        let mut feed = replica.subscribe();

        let todo = replica.insert("  buy milk ").await.unwrap();
        assert_eq!(todo.name, "buy milk");
        let done = replica.toggle(&todo.id).await.unwrap();
        assert_eq!(done.state, TodoState::Done);
        assert!(done.last_change > todo.last_change);

        assert_eq!(
            feed.recv().await,
            Some(PullStreamItem::Event(ReplicationEvent::single(todo)))
        );
        assert_eq!(
            feed.recv().await,
            Some(PullStreamItem::Event(ReplicationEvent::single(done)))
        );
    }

    #[tokio::test]
    async fn empty_name_is_rejected() {
        let replica = Replica::in_memory();
        assert!(matches!(
            replica.insert("   ").await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn delete_keeps_tombstone_for_replication() {
        let replica = Replica::in_memory();
        let todo = replica.insert("a").await.unwrap();
        replica.delete(&todo.id).await.unwrap();

        assert!(replica.get(&todo.id).await.unwrap().is_none());
        assert!(replica.list().await.unwrap().is_empty());

        let batch = replica.pull(&Checkpoint::zero(), 10).await.unwrap();
        assert_eq!(batch.documents.len(), 1);
        assert!(batch.documents[0].deleted);

        assert!(matches!(
            replica.rename(&todo.id, "b").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn clear_completed_tombstones_done_todos() {
        let replica = Replica::in_memory();
        let keep = replica.insert("keep").await.unwrap();
        let drop = replica.insert("drop").await.unwrap();
        replica.toggle(&drop.id).await.unwrap();

        let removed = replica.clear_completed().await.unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, drop.id);

        let remaining = replica.list().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, keep.id);
    }

    #[tokio::test]
    async fn push_publishes_one_event_per_batch() {
        let replica = Replica::in_memory();
        let mut feed = replica.subscribe();

        let conflicts = replica
            .push(&[
                row(todo("a", "a", 100), None),
                row(todo("b", "b", 100), None),
            ])
            .await
            .unwrap();
        assert!(conflicts.is_empty());

        let Some(PullStreamItem::Event(event)) = feed.recv().await else {
            panic!("expected an event");
        };
        assert_eq!(event.documents.len(), 2);
        assert_eq!(event.checkpoint, Some(Checkpoint::new(100, "b")));
        assert!(feed.try_recv().is_none());
    }

    #[tokio::test]
    async fn invalid_push_row_rejects_whole_batch() {
        let replica = Replica::in_memory();
        let result = replica
            .push(&[
                row(todo("ok", "a", 100), None),
                row(todo(&"x".repeat(30), "b", 100), None),
            ])
            .await;

        assert!(matches!(result, Err(Error::Validation(_))));
        assert_eq!(replica.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn conflicting_push_leaves_store_unchanged() {
        let replica = Replica::in_memory();
        let current = todo("t1", "server", 200);
        replica.push(&[row(current.clone(), None)]).await.unwrap();

        let conflicts = replica
            .push(&[row(todo("t1", "client", 300), Some(todo("t1", "x", 150)))])
            .await
            .unwrap();
        assert_eq!(conflicts, vec![current.clone()]);
        let batch = replica.pull(&Checkpoint::zero(), 10).await.unwrap();
        assert_eq!(batch.documents, vec![current]);
    }

    #[tokio::test]
    async fn apply_from_master_keeps_newer_pending_local_change() {
        let replica = Replica::in_memory();
        let base = todo("t1", "base", 100);
        replica.apply_from_master("http", &[base.clone()]).await.unwrap();

        let local = replica.rename(&base.id, "local").await.unwrap();

        // Master sends an older concurrent edit: ours wins, stays pending
        let remote = todo("t1", "remote", 150);
        assert_eq!(replica.apply_from_master("http", &[remote.clone()]).await.unwrap(), 0);
        assert_eq!(replica.get(&base.id).await.unwrap(), Some(local.clone()));

        let pending = replica.pending("http", 10).await.unwrap();
        assert_eq!(pending, vec![row(local, Some(remote))]);
    }

    #[tokio::test]
    async fn apply_from_master_overwrites_clean_records() {
        let replica = Replica::in_memory();
        replica
            .apply_from_master("http", &[todo("t1", "v1", 100)])
            .await
            .unwrap();
        replica
            .apply_from_master("http", &[todo("t1", "v2", 50)])
            .await
            .unwrap();

        // No local change was pending, so the master's state is taken as is
        assert_eq!(
            replica.get(&TodoId::from("t1")).await.unwrap(),
            Some(todo("t1", "v2", 50))
        );
        assert!(replica.pending("http", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn confirm_push_applies_master_win_and_acknowledges_rest() {
        let replica = Replica::in_memory();
        let a = replica.insert("a").await.unwrap();
        let b = replica.insert("b").await.unwrap();

        let rows = replica.pending("http", 10).await.unwrap();
        assert_eq!(rows.len(), 2);

        let mut newer = b.clone();
        newer.name = "from master".to_string();
        newer.last_change = b.last_change + 10_000;

        replica
            .confirm_push("http", &rows, &[newer.clone()])
            .await
            .unwrap();

        assert_eq!(replica.get(&a.id).await.unwrap(), Some(a));
        assert_eq!(replica.get(&b.id).await.unwrap(), Some(newer));
        assert!(replica.pending("http", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn shutdown_refuses_writes_and_ends_feed() {
        let replica = Replica::in_memory();
        let mut feed = replica.subscribe();
        replica.shutdown();

        assert!(matches!(replica.insert("a").await, Err(Error::Closed)));
        assert_eq!(feed.recv().await, None);
    }
}
