//! Client-side replication loop against one master
//!
//! The loop first catches up (pull until an empty batch, then push every
//! pending row) and then, in live mode, follows both directions: local
//! writes are pushed as they happen and master events are applied as they
//! arrive. A lost or lagging master stream triggers a pull from the zero
//! checkpoint and a fresh stream.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn, Instrument};

use crate::config::ReplicationConfig;
use crate::models::{Checkpoint, PullStreamItem, PushRow, ReplicationEvent};
use crate::services::Replica;
use crate::{Error, Result};

use super::master::{PullStream, ReplicationMaster};

const ERROR_CHANNEL_CAPACITY: usize = 64;

/// Handle on a running replication.
///
/// Dropping the handle stops the loop.
pub struct ReplicationState {
    identifier: String,
    replica: Replica,
    shutdown_tx: watch::Sender<bool>,
    errors_tx: broadcast::Sender<String>,
    active_rx: watch::Receiver<bool>,
    in_sync_rx: watch::Receiver<bool>,
    failure_rx: watch::Receiver<Option<String>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ReplicationState {
    /// Spawn the replication loop.
    pub fn start<M: ReplicationMaster>(
        replica: Replica,
        master: M,
        config: ReplicationConfig,
    ) -> Result<Self> {
        config.validate()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (errors_tx, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);
        let (active_tx, active_rx) = watch::channel(false);
        let (in_sync_tx, in_sync_rx) = watch::channel(false);
        let (failure_tx, failure_rx) = watch::channel(None);

        let worker = Worker {
            replica: replica.clone(),
            master,
            config: config.clone(),
            errors_tx: errors_tx.clone(),
            active_tx,
            in_sync_tx,
            failure_tx,
        };

        let span = tracing::info_span!("replication", identifier = %config.identifier);
        let handle = tokio::spawn(worker.run(shutdown_rx).instrument(span));

        Ok(Self {
            identifier: config.identifier,
            replica,
            shutdown_tx,
            errors_tx,
            active_rx,
            in_sync_rx,
            failure_rx,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Non-fatal errors raised by the loop.
    pub fn errors(&self) -> broadcast::Receiver<String> {
        self.errors_tx.subscribe()
    }

    /// Whether a pull or push cycle is currently running.
    pub fn active(&self) -> watch::Receiver<bool> {
        self.active_rx.clone()
    }

    /// `true` after a cycle that left nothing to push, `false` while one runs
    /// or after one failed.
    pub fn in_sync(&self) -> watch::Receiver<bool> {
        self.in_sync_rx.clone()
    }

    /// Wait until the initial sync has finished and no local write is
    /// waiting to be pushed.
    ///
    /// A one-shot replication whose cycle failed ends its loop; the failure
    /// is returned here instead of waiting forever.
    pub async fn await_in_sync(&self) -> Result<()> {
        let mut in_sync = self.in_sync_rx.clone();
        loop {
            let synced = *in_sync.borrow_and_update();
            if synced && self.replica.pending(&self.identifier, 1).await?.is_empty() {
                return Ok(());
            }
            if in_sync.changed().await.is_err() {
                let synced = *in_sync.borrow();
                if synced && self.replica.pending(&self.identifier, 1).await?.is_empty() {
                    return Ok(());
                }
                return Err(match self.failure_rx.borrow().clone() {
                    Some(message) => Error::Replication(message),
                    None => Error::Closed,
                });
            }
        }
    }

    /// Stop the loop and wait for it to exit.
    pub async fn cancel(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(error) = handle.await {
                warn!(%error, "Replication task ended abnormally");
            }
        }
    }
}

impl Drop for ReplicationState {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Ticks once per `period`, starting one period from now.
fn retry_timer(period: Duration) -> Interval {
    let mut timer = tokio::time::interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

/// How a live session ended
enum LiveExit {
    Shutdown,
    Reconnect,
}

struct Worker<M> {
    replica: Replica,
    master: M,
    config: ReplicationConfig,
    errors_tx: broadcast::Sender<String>,
    active_tx: watch::Sender<bool>,
    in_sync_tx: watch::Sender<bool>,
    failure_tx: watch::Sender<Option<String>>,
}

impl<M: ReplicationMaster> Worker<M> {
    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let _ = shutdown_rx.borrow_and_update();
        info!(live = self.config.live, "Starting replication");

        let mut from_zero = false;
        loop {
            let stream = if self.config.live {
                match self.master.stream().await {
                    Ok(stream) => Some(stream),
                    Err(error) => {
                        self.report(&error, "Failed to open master stream");
                        if self.wait_retry(&mut shutdown_rx).await {
                            continue;
                        }
                        break;
                    }
                }
            } else {
                None
            };

            let start = if from_zero {
                Checkpoint::zero()
            } else {
                match self.replica.checkpoint(&self.config.identifier).await {
                    Ok(checkpoint) => checkpoint,
                    Err(error) => {
                        self.report(&error, "Failed to read checkpoint");
                        let _ = self.failure_tx.send(Some(error.to_string()));
                        break;
                    }
                }
            };

            let synced = tokio::select! {
                result = self.sync_from(start) => result,
                _ = shutdown_rx.changed() => break,
            };
            match synced {
                Ok(()) => from_zero = false,
                Err(Error::Closed) => break,
                Err(error) => {
                    self.report(&error, "Sync cycle failed");
                    if !self.config.live {
                        let _ = self.failure_tx.send(Some(error.to_string()));
                        break;
                    }
                    if self.wait_retry(&mut shutdown_rx).await {
                        continue;
                    }
                    break;
                }
            }

            let Some(stream) = stream else {
                info!("One-shot replication finished");
                break;
            };
            match self.follow(stream, &mut shutdown_rx).await {
                LiveExit::Shutdown => break,
                LiveExit::Reconnect => {
                    info!("Master stream lost, resyncing from zero");
                    from_zero = true;
                }
            }
        }

        let _ = self.active_tx.send(false);
        debug!("Replication loop stopped");
    }

    /// Pull from `start` until caught up, then push everything pending.
    async fn sync_from(&self, start: Checkpoint) -> Result<()> {
        self.begin_cycle();
        let result = async {
            self.pull_until_empty(start).await?;
            self.push_pending().await
        }
        .await;
        self.end_cycle(result.is_ok()).await;
        result
    }

    async fn follow(
        &self,
        mut stream: PullStream,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> LiveExit {
        let mut local = self.replica.subscribe();
        // Writes made between the initial push and this subscription
        let mut needs_push = true;
        let mut retry = retry_timer(self.config.retry_interval());

        loop {
            if needs_push {
                needs_push = !self.push_cycle().await;
                if self.replica.is_closed() {
                    return LiveExit::Shutdown;
                }
            }

            tokio::select! {
                biased;

                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        return LiveExit::Shutdown;
                    }
                }

                item = stream.recv() => match item {
                    Some(PullStreamItem::Event(event)) => {
                        if let Err(error) = self.apply_event(event).await {
                            if matches!(error, Error::Closed) {
                                return LiveExit::Shutdown;
                            }
                            self.report(&error, "Failed to apply master event");
                        }
                    }
                    Some(PullStreamItem::Resync) | None => return LiveExit::Reconnect,
                },

                item = local.recv() => match item {
                    Some(PullStreamItem::Event(_)) => needs_push = true,
                    Some(PullStreamItem::Resync) => needs_push = true,
                    None => {
                        if self.replica.is_closed() {
                            return LiveExit::Shutdown;
                        }
                        local = self.replica.subscribe();
                        needs_push = true;
                    }
                },

                _ = retry.tick() => {}
            }
        }
    }

    /// One push cycle with activity reporting; `true` on success.
    async fn push_cycle(&self) -> bool {
        self.begin_cycle();
        let result = self.push_pending().await;
        let ok = result.is_ok();
        if let Err(error) = result {
            self.report(&error, "Push failed, will retry");
        }
        self.end_cycle(ok).await;
        ok
    }

    async fn apply_event(&self, event: ReplicationEvent) -> Result<()> {
        let identifier = &self.config.identifier;
        self.begin_cycle();
        let result = async {
            let applied = self
                .replica
                .apply_from_master(identifier, &event.documents)
                .await?;
            if let Some(checkpoint) = event.checkpoint {
                let current = self.replica.checkpoint(identifier).await?;
                if checkpoint > current {
                    self.replica.set_checkpoint(identifier, &checkpoint).await?;
                }
            }
            debug!(documents = event.documents.len(), applied, "Applied master event");
            Ok(())
        }
        .await;
        self.end_cycle(result.is_ok()).await;
        result
    }

    async fn pull_until_empty(&self, start: Checkpoint) -> Result<()> {
        let identifier = &self.config.identifier;
        let mut checkpoint = start;
        loop {
            let batch = self
                .master
                .pull(&checkpoint, self.config.pull_batch_size)
                .await?;
            if batch.documents.is_empty() {
                break;
            }

            let applied = self
                .replica
                .apply_from_master(identifier, &batch.documents)
                .await?;
            debug!(
                documents = batch.documents.len(),
                applied,
                updated_at = batch.checkpoint.updated_at,
                "Pulled batch"
            );

            if batch.checkpoint <= checkpoint {
                warn!("Master returned a non-advancing checkpoint, stopping pull");
                break;
            }
            checkpoint = batch.checkpoint;
            self.replica.set_checkpoint(identifier, &checkpoint).await?;
        }
        Ok(())
    }

    /// Push pending rows in batches until none are left.
    ///
    /// Rows that lose a conflict are re-pushed against the master's real
    /// state in the next round; a round that makes no progress ends the cycle.
    async fn push_pending(&self) -> Result<()> {
        let identifier = &self.config.identifier;
        let mut previous: Vec<PushRow> = Vec::new();
        loop {
            let rows = self
                .replica
                .pending(identifier, self.config.push_batch_size)
                .await?;
            if rows.is_empty() {
                return Ok(());
            }
            if rows == previous {
                warn!(rows = rows.len(), "Push made no progress, deferring");
                return Ok(());
            }

            let conflicts = self.master.push(&rows).await?;
            debug!(rows = rows.len(), conflicts = conflicts.len(), "Pushed batch");
            self.replica
                .confirm_push(identifier, &rows, &conflicts)
                .await?;
            previous = rows;
        }
    }

    fn begin_cycle(&self) {
        let _ = self.active_tx.send(true);
        let _ = self.in_sync_tx.send(false);
    }

    async fn end_cycle(&self, ok: bool) {
        let clean = ok
            && self
                .replica
                .pending(&self.config.identifier, 1)
                .await
                .is_ok_and(|rows| rows.is_empty());
        let _ = self.active_tx.send(false);
        let _ = self.in_sync_tx.send(clean);
    }

    /// Sleep for the retry interval; `false` when shut down meanwhile.
    async fn wait_retry(&self, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            () = tokio::time::sleep(self.config.retry_interval()) => true,
            result = shutdown_rx.changed() => result.is_ok() && !*shutdown_rx.borrow(),
        }
    }

    fn report(&self, error: &Error, context: &str) {
        warn!(%error, "{context}");
        let _ = self.errors_tx.send(format!("{context}: {error}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PullBatch, Todo, TodoId, TodoState};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn config(live: bool) -> ReplicationConfig {
        ReplicationConfig {
            live,
            retry_interval_ms: 50,
            ..ReplicationConfig::default()
        }
    }

    fn names(todos: &[Todo]) -> Vec<String> {
        let mut names = todos.iter().map(|t| t.name.clone()).collect::<Vec<_>>();
        names.sort();
        names
    }

    #[tokio::test]
    async fn one_shot_sync_exchanges_both_directions() {
        let server = Replica::in_memory();
        let client = Replica::in_memory();
        server.insert("from server").await.unwrap();
        client.insert("from client").await.unwrap();

        let state = ReplicationState::start(client.clone(), server.clone(), config(false)).unwrap();
        state.await_in_sync().await.unwrap();
        state.cancel().await;

        let expected = vec!["from client".to_string(), "from server".to_string()];
        assert_eq!(names(&client.list().await.unwrap()), expected);
        assert_eq!(names(&server.list().await.unwrap()), expected);
        assert_ne!(
            client.checkpoint("http-todos").await.unwrap(),
            Checkpoint::zero()
        );
    }

    #[tokio::test]
    async fn live_replication_follows_both_sides() {
        let server = Replica::in_memory();
        let client = Replica::in_memory();
        let state = ReplicationState::start(client.clone(), server.clone(), config(true)).unwrap();
        state.await_in_sync().await.unwrap();

        let local = client.insert("local").await.unwrap();
        state.await_in_sync().await.unwrap();
        assert_eq!(server.get(&local.id).await.unwrap(), Some(local));

        let remote = server.insert("remote").await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while client.get(&remote.id).await.unwrap().is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        state.cancel().await;
    }

    #[tokio::test]
    async fn newer_local_edit_survives_push_conflict() {
        let server = Replica::in_memory();
        let client = Replica::in_memory();
        let base = Todo {
            id: TodoId::from("t1"),
            name: "base".to_string(),
            state: TodoState::Open,
            last_change: 100,
            deleted: false,
        };
        server
            .push(&[PushRow {
                new_document_state: base.clone(),
                assumed_master_state: None,
            }])
            .await
            .unwrap();
        // The client already holds the record but never saw it from this master
        client
            .push(&[PushRow {
                new_document_state: Todo {
                    name: "client".to_string(),
                    last_change: 200,
                    ..base.clone()
                },
                assumed_master_state: None,
            }])
            .await
            .unwrap();

        let state = ReplicationState::start(client.clone(), server.clone(), config(false)).unwrap();
        state.await_in_sync().await.unwrap();
        state.cancel().await;

        let expected = Some(Todo {
            name: "client".to_string(),
            last_change: 200,
            ..base
        });
        assert_eq!(client.get(&TodoId::from("t1")).await.unwrap(), expected);
        assert_eq!(server.get(&TodoId::from("t1")).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn cancel_stops_the_loop() {
        let state =
            ReplicationState::start(Replica::in_memory(), Replica::in_memory(), config(true))
                .unwrap();
        state.await_in_sync().await.unwrap();
        state.cancel().await;
        assert!(!*state.active().borrow());
    }

    /// Serves pulls and the stream from `inner` but refuses every push.
    struct RefusingMaster {
        inner: Replica,
        pushes: Arc<AtomicUsize>,
    }

    impl RefusingMaster {
        fn new() -> (Self, Arc<AtomicUsize>) {
            let pushes = Arc::new(AtomicUsize::new(0));
            let master = Self {
                inner: Replica::in_memory(),
                pushes: Arc::clone(&pushes),
            };
            (master, pushes)
        }
    }

    impl ReplicationMaster for RefusingMaster {
        async fn pull(&self, checkpoint: &Checkpoint, batch_size: usize) -> Result<PullBatch> {
            self.inner.pull(checkpoint, batch_size).await
        }

        async fn push(&self, _rows: &[PushRow]) -> Result<Vec<Todo>> {
            self.pushes.fetch_add(1, Ordering::SeqCst);
            Err(Error::Remote("503 Service Unavailable".to_string()))
        }

        async fn stream(&self) -> Result<PullStream> {
            ReplicationMaster::stream(&self.inner).await
        }
    }

    #[tokio::test]
    async fn failed_one_shot_sync_reports_instead_of_retrying() {
        let client = Replica::in_memory();
        client.insert("offline").await.unwrap();
        let (master, pushes) = RefusingMaster::new();

        let state = ReplicationState::start(client.clone(), master, config(false)).unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(5), state.await_in_sync())
            .await
            .unwrap();
        match outcome {
            Err(Error::Replication(message)) => assert!(message.contains("503")),
            other => panic!("expected a replication failure, got {other:?}"),
        }

        // Several retry intervals pass without another attempt
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(pushes.load(Ordering::SeqCst), 1);
        assert!(!*state.active().borrow());
        assert_eq!(client.pending("http-todos", 10).await.unwrap().len(), 1);
        state.cancel().await;
    }

    #[tokio::test(start_paused = true)]
    async fn live_sync_failures_retry_once_per_interval() {
        let client = Replica::in_memory();
        client.insert("offline").await.unwrap();
        let (master, pushes) = RefusingMaster::new();
        let config = ReplicationConfig {
            retry_interval_ms: 1_000,
            ..config(true)
        };

        let state = ReplicationState::start(client, master, config).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pushes.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(pushes.load(Ordering::SeqCst), 2);
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(pushes.load(Ordering::SeqCst), 3);

        state.cancel().await;
    }

    #[tokio::test(start_paused = true)]
    async fn retry_timer_first_fires_after_one_period() {
        let period = Duration::from_millis(1_000);
        let mut timer = retry_timer(period);

        assert!(tokio::time::timeout(period / 2, timer.tick()).await.is_err());
        assert!(tokio::time::timeout(period, timer.tick()).await.is_ok());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = ReplicationConfig {
            push_batch_size: 0,
            ..ReplicationConfig::default()
        };
        assert!(ReplicationState::start(Replica::in_memory(), Replica::in_memory(), config).is_err());
    }
}
