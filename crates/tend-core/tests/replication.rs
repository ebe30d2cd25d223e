//! Client and server replicas converging through the replication loop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;
use tend_core::replication::PullStream;
use tend_core::{
    Checkpoint, PullBatch, PullStreamItem, PushRow, Replica, ReplicationConfig,
    ReplicationMaster, ReplicationState, Result, Todo,
};
use tokio::sync::{mpsc, watch};

macro_rules! eventually {
    ($condition:expr) => {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !$condition {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time")
    };
}

fn live_config() -> ReplicationConfig {
    ReplicationConfig {
        retry_interval_ms: 50,
        ..ReplicationConfig::default()
    }
}

async fn names(replica: &Replica) -> Vec<String> {
    let mut names = replica
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|todo| todo.name)
        .collect::<Vec<_>>();
    names.sort();
    names
}

/// Serves pulls and pushes from a replica but only delivers the stream
/// items the test injects.
#[derive(Clone)]
struct ScriptedMaster {
    inner: Replica,
    streams: Arc<Mutex<Vec<mpsc::Sender<PullStreamItem>>>>,
}

impl ScriptedMaster {
    fn new(inner: Replica) -> Self {
        Self {
            inner,
            streams: Arc::default(),
        }
    }

    fn opened(&self) -> usize {
        self.streams.lock().unwrap().len()
    }

    async fn inject(&self, item: PullStreamItem) {
        let tx = self.streams.lock().unwrap().last().cloned().unwrap();
        tx.send(item).await.unwrap();
    }
}

impl ReplicationMaster for ScriptedMaster {
    async fn pull(&self, checkpoint: &Checkpoint, batch_size: usize) -> Result<PullBatch> {
        self.inner.pull(checkpoint, batch_size).await
    }

    async fn push(&self, rows: &[PushRow]) -> Result<Vec<Todo>> {
        self.inner.push(rows).await
    }

    async fn stream(&self) -> Result<PullStream> {
        let (tx, rx) = mpsc::channel(16);
        self.streams.lock().unwrap().push(tx);
        Ok(rx)
    }
}

/// Follows the real live feed of `inner`, but holds delivery back until
/// the gate opens. Events published meanwhile pile up in the subscription.
#[derive(Clone)]
struct GatedMaster {
    inner: Replica,
    gate: watch::Receiver<bool>,
    opened: Arc<AtomicUsize>,
}

impl GatedMaster {
    fn new(inner: Replica, gate: watch::Receiver<bool>) -> Self {
        Self {
            inner,
            gate,
            opened: Arc::default(),
        }
    }

    fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

impl ReplicationMaster for GatedMaster {
    async fn pull(&self, checkpoint: &Checkpoint, batch_size: usize) -> Result<PullBatch> {
        self.inner.pull(checkpoint, batch_size).await
    }

    async fn push(&self, rows: &[PushRow]) -> Result<Vec<Todo>> {
        self.inner.push(rows).await
    }

    async fn stream(&self) -> Result<PullStream> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let mut subscription = self.inner.subscribe();
        let mut gate = self.gate.clone();
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            if gate.wait_for(|open| *open).await.is_err() {
                return;
            }
            while let Some(item) = subscription.recv().await {
                if tx.send(item).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

/// Every record a replica holds, tombstones included, in replication order.
async fn documents(replica: &Replica) -> Vec<Todo> {
    replica
        .pull(&Checkpoint::zero(), 10_000)
        .await
        .unwrap()
        .documents
}

#[tokio::test]
async fn two_clients_converge_through_server() {
    let server = Replica::in_memory();
    let alice = Replica::in_memory();
    let bob = Replica::in_memory();

    let alice_sync = ReplicationState::start(alice.clone(), server.clone(), live_config()).unwrap();
    let bob_sync = ReplicationState::start(bob.clone(), server.clone(), live_config()).unwrap();
    alice_sync.await_in_sync().await.unwrap();
    bob_sync.await_in_sync().await.unwrap();

    let milk = alice.insert("buy milk").await.unwrap();
    bob.insert("walk dog").await.unwrap();

    let expected = vec!["buy milk".to_string(), "walk dog".to_string()];
    eventually!(names(&alice).await == expected && names(&bob).await == expected);

    bob.toggle(&milk.id).await.unwrap();
    eventually!(alice.get(&milk.id).await.unwrap().map(|t| t.state) == Some(tend_core::TodoState::Done));

    alice.delete(&milk.id).await.unwrap();
    eventually!(bob.get(&milk.id).await.unwrap().is_none());
    assert_eq!(names(&server).await, vec!["walk dog".to_string()]);

    alice_sync.cancel().await;
    bob_sync.cancel().await;
}

#[tokio::test]
async fn resync_recovers_writes_missed_on_the_stream() {
    let server = Replica::in_memory();
    let client = Replica::in_memory();
    let master = ScriptedMaster::new(server.clone());

    let sync = ReplicationState::start(client.clone(), master.clone(), live_config()).unwrap();
    sync.await_in_sync().await.unwrap();
    assert_eq!(master.opened(), 1);

    // The scripted stream never delivers this write
    let missed = server.insert("missed").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(client.get(&missed.id).await.unwrap().is_none());

    master.inject(PullStreamItem::Resync).await;
    eventually!(client.get(&missed.id).await.unwrap().is_some());
    eventually!(master.opened() == 2);

    sync.cancel().await;
}

#[tokio::test]
async fn positionless_events_keep_the_checkpoint() {
    let server = Replica::in_memory();
    let client = Replica::in_memory();
    let master = ScriptedMaster::new(server.clone());
    server.insert("first").await.unwrap();

    let sync = ReplicationState::start(client.clone(), master.clone(), live_config()).unwrap();
    sync.await_in_sync().await.unwrap();
    let before = client.checkpoint("http-todos").await.unwrap();

    let forwarded = Todo::new("forwarded");
    master
        .inject(PullStreamItem::Event(tend_core::ReplicationEvent {
            documents: vec![forwarded.clone()],
            checkpoint: None,
        }))
        .await;
    eventually!(client.get(&forwarded.id).await.unwrap().is_some());
    assert_eq!(client.checkpoint("http-todos").await.unwrap(), before);

    sync.cancel().await;
}

#[tokio::test]
async fn persisted_client_resumes_from_stored_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("client.db");
    let server = Replica::in_memory();
    server.insert("one").await.unwrap();

    {
        let client = Replica::open_path(&path).unwrap();
        let config = ReplicationConfig {
            live: false,
            ..live_config()
        };
        let sync = ReplicationState::start(client.clone(), server.clone(), config).unwrap();
        sync.await_in_sync().await.unwrap();
        sync.cancel().await;
    }

    let client = Replica::open_path(&path).unwrap();
    assert_eq!(names(&client).await, vec!["one".to_string()]);
    let checkpoint = client.checkpoint("http-todos").await.unwrap();
    assert_ne!(checkpoint, Checkpoint::zero());
    assert!(server.pull(&checkpoint, 10).await.unwrap().documents.is_empty());
}

#[tokio::test]
async fn resync_rebuilds_the_same_state_as_continuous_following() {
    let server = Replica::in_memory().with_subscriber_capacity(8);
    let (_always_open, open_gate) = watch::channel(true);
    let (gate_tx, gate_rx) = watch::channel(false);

    let follower = Replica::in_memory();
    let follower_master = GatedMaster::new(server.clone(), open_gate);
    let follower_sync =
        ReplicationState::start(follower.clone(), follower_master.clone(), live_config())
            .unwrap();
    let lagging = Replica::in_memory();
    let lagging_master = GatedMaster::new(server.clone(), gate_rx);
    let lagging_sync =
        ReplicationState::start(lagging.clone(), lagging_master.clone(), live_config()).unwrap();
    follower_sync.await_in_sync().await.unwrap();
    lagging_sync.await_in_sync().await.unwrap();

    // Far more writes than the feed buffers, with edits and tombstones
    let mut ids = Vec::new();
    for index in 0..20 {
        let todo = server.insert(&format!("task {index}")).await.unwrap();
        ids.push(todo.id);
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    for (index, id) in ids.iter().enumerate() {
        if index % 3 == 0 {
            server.rename(id, &format!("renamed {index}")).await.unwrap();
        }
        if index % 4 == 0 {
            server.toggle(id).await.unwrap();
        }
        if index % 5 == 0 {
            server.delete(id).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    lagging.insert("written while lagging").await.unwrap();
    eventually!(documents(&server).await.len() == 21);

    gate_tx.send(true).unwrap();

    let expected = documents(&server).await;
    eventually!(documents(&lagging).await == expected && documents(&follower).await == expected);
    let head = expected.last().map(Checkpoint::of).unwrap();
    eventually!(
        lagging.checkpoint("http-todos").await.unwrap() == head
            && follower.checkpoint("http-todos").await.unwrap() == head
    );
    assert_eq!(names(&lagging).await, names(&follower).await);

    // Only the lagging client went through a resync
    assert!(lagging_master.opened() >= 2);
    assert_eq!(follower_master.opened(), 1);

    follower_sync.cancel().await;
    lagging_sync.cancel().await;
}
