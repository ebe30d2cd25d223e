//! A replica's membership in a peer mesh.
//!
//! Every connected peer gets its own task. The task serves the peer's pull,
//! push and subscribe requests against the local replica and, at the same
//! time, runs a [`ReplicationState`] that treats the peer as a master. A
//! peer that misbehaves or disappears only ends its own task.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use super::protocol::{MeshMessage, MeshRequest, MeshResponse};
use super::room::{RoomId, RoomToken};
use super::transport::{MeshTransport, PeerChannel, PeerId, TransportEvent, TransportEvents};
use crate::config::MeshConfig;
use crate::models::{Checkpoint, PullBatch, PullStreamItem, PushRow, Todo};
use crate::replication::{PullStream, ReplicationMaster, ReplicationState, Subscription};
use crate::services::Replica;
use crate::{Error, Result};

const CHANNEL_CAPACITY: usize = 64;
const MAX_SERVED_BATCH: usize = 1000;

/// Where the replication with one peer stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    Connected,
    Syncing,
    InSync,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerState {
    pub peer_id: PeerId,
    pub status: PeerStatus,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Current status per peer plus the change feed
#[derive(Clone)]
struct StatusBoard {
    tx: broadcast::Sender<PeerState>,
    peers: Arc<Mutex<BTreeMap<PeerId, PeerStatus>>>,
}

impl StatusBoard {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            peers: Arc::default(),
        }
    }

    fn set(&self, peer: &PeerId, status: PeerStatus) {
        {
            let mut peers = lock(&self.peers);
            if status == PeerStatus::Disconnected {
                if peers.remove(peer).is_none() {
                    return;
                }
            } else if peers.insert(peer.clone(), status) == Some(status) {
                return;
            }
        }
        debug!(%peer, ?status, "Peer status changed");
        let _ = self.tx.send(PeerState {
            peer_id: peer.clone(),
            status,
        });
    }

    fn snapshot(&self) -> Vec<PeerState> {
        lock(&self.peers)
            .iter()
            .map(|(peer_id, status)| PeerState {
                peer_id: peer_id.clone(),
                status: *status,
            })
            .collect()
    }
}

/// Handle on a joined room. Dropping it leaves the room.
pub struct MeshSession {
    room: RoomId,
    peer_id: PeerId,
    board: StatusBoard,
    errors_tx: broadcast::Sender<String>,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl MeshSession {
    /// Join the room derived from `token` and replicate with every peer in it.
    pub async fn start<T: MeshTransport>(
        replica: Replica,
        transport: T,
        token: &RoomToken,
        config: MeshConfig,
    ) -> Result<Self> {
        config.replication.validate()?;

        let room = token.room_id();
        let peer_id = PeerId::new();
        let events = transport.join(&room, &peer_id).await?;
        info!(%room, peer = %peer_id, "Joined mesh room");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (errors_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let board = StatusBoard::new();
        let context = PeerContext {
            replica,
            config,
            board: board.clone(),
            errors_tx: errors_tx.clone(),
        };

        let span = tracing::info_span!("mesh", room = %room, peer = %peer_id);
        let handle = tokio::spawn(
            run_session(
                transport,
                room.clone(),
                peer_id.clone(),
                events,
                context,
                shutdown_rx,
            )
            .instrument(span),
        );

        Ok(Self {
            room,
            peer_id,
            board,
            errors_tx,
            shutdown_tx,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub const fn room(&self) -> &RoomId {
        &self.room
    }

    pub const fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Status changes of connected peers.
    pub fn peer_states(&self) -> broadcast::Receiver<PeerState> {
        self.board.tx.subscribe()
    }

    /// Current status of every connected peer.
    pub fn peers(&self) -> Vec<PeerState> {
        self.board.snapshot()
    }

    /// Non-fatal per-peer errors.
    pub fn errors(&self) -> broadcast::Receiver<String> {
        self.errors_tx.subscribe()
    }

    /// Disconnect from every peer and leave the room.
    pub async fn leave(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = lock(&self.handle).take();
        if let Some(handle) = handle {
            if let Err(error) = handle.await {
                warn!(%error, "Mesh session ended abnormally");
            }
        }
    }
}

impl Drop for MeshSession {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[derive(Clone)]
struct PeerContext {
    replica: Replica,
    config: MeshConfig,
    board: StatusBoard,
    errors_tx: broadcast::Sender<String>,
}

impl PeerContext {
    fn report(&self, peer: &PeerId, message: &str) {
        let _ = self.errors_tx.send(format!("peer {peer}: {message}"));
    }
}

async fn run_session<T: MeshTransport>(
    transport: T,
    room: RoomId,
    me: PeerId,
    mut events: TransportEvents,
    context: PeerContext,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let _ = shutdown_rx.borrow_and_update();
    let mut peers: HashMap<PeerId, PeerTask> = HashMap::new();

    loop {
        tokio::select! {
            biased;

            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }

            event = events.recv() => match event {
                Some(TransportEvent::PeerConnected { peer, channel }) => {
                    info!(%peer, "Peer connected");
                    if let Some(previous) = peers.remove(&peer) {
                        previous.stop().await;
                    }
                    let task = PeerTask::spawn(context.clone(), peer.clone(), channel);
                    peers.insert(peer, task);
                }
                Some(TransportEvent::PeerDisconnected { peer }) => {
                    info!(%peer, "Peer disconnected");
                    if let Some(task) = peers.remove(&peer) {
                        task.stop().await;
                    }
                }
                None => {
                    warn!("Transport closed the room");
                    break;
                }
            },
        }

        peers.retain(|_, task| !task.handle.is_finished());
    }

    for (_, task) in peers.drain() {
        task.stop().await;
    }
    transport.leave(&room, &me).await;
    info!("Left mesh room");
}

struct PeerTask {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PeerTask {
    fn spawn(context: PeerContext, peer: PeerId, channel: PeerChannel) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let span = tracing::info_span!("peer", peer = %peer);
        let handle = tokio::spawn(run_peer(context, peer, channel, shutdown_rx).instrument(span));
        Self {
            shutdown_tx,
            handle,
        }
    }

    async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(error) = self.handle.await {
            warn!(%error, "Peer task ended abnormally");
        }
    }
}

async fn run_peer(
    context: PeerContext,
    peer: PeerId,
    channel: PeerChannel,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let PeerChannel {
        sender,
        mut receiver,
    } = channel;
    context.board.set(&peer, PeerStatus::Connected);

    let master = PeerMaster::new(
        sender.clone(),
        context.config.request_timeout(),
        context.config.subscriber_capacity,
    );
    let replication_config = context.config.replication_for(peer.as_str());
    let identifier = replication_config.identifier.clone();
    let replication = match ReplicationState::start(
        context.replica.clone(),
        master.clone(),
        replication_config,
    ) {
        Ok(replication) => replication,
        Err(error) => {
            context.report(&peer, &error.to_string());
            context.board.set(&peer, PeerStatus::Disconnected);
            return;
        }
    };
    let status_watcher = tokio::spawn(watch_status(
        replication.in_sync(),
        context.board.clone(),
        peer.clone(),
    ));
    let error_relay = tokio::spawn(relay_errors(
        replication.errors(),
        context.clone(),
        peer.clone(),
    ));

    let mut forwarder: Option<JoinHandle<()>> = None;
    loop {
        tokio::select! {
            biased;

            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }

            frame = receiver.recv() => {
                let Some(frame) = frame else {
                    debug!("Peer channel closed");
                    break;
                };
                match MeshMessage::from_frame(&frame) {
                    Ok(message) => {
                        handle_message(&context, &sender, &master, &mut forwarder, message);
                    }
                    Err(error) => {
                        warn!(%error, "Ignoring malformed frame from peer");
                        context.report(&peer, &format!("malformed frame: {error}"));
                    }
                }
            }
        }
    }

    master.close();
    if let Some(forwarder) = forwarder {
        forwarder.abort();
    }
    replication.cancel().await;
    drop(replication);
    // Peer ids are per session, so nothing stored under this one is reused
    if let Err(error) = context.replica.clear_replication(&identifier).await {
        warn!(%error, "Failed to clear peer replication state");
    }
    let _ = status_watcher.await;
    error_relay.abort();
    context.board.set(&peer, PeerStatus::Disconnected);
}

fn handle_message(
    context: &PeerContext,
    sender: &mpsc::Sender<String>,
    master: &PeerMaster,
    forwarder: &mut Option<JoinHandle<()>>,
    message: MeshMessage,
) {
    match message {
        MeshMessage::Request {
            id,
            request: MeshRequest::Subscribe,
        } => {
            // Subscribe before acknowledging so no write falls in between
            let subscription = context.replica.subscribe();
            let task = tokio::spawn(forward_events(subscription, sender.clone()));
            if let Some(previous) = forwarder.replace(task) {
                previous.abort();
            }
            debug!("Peer subscribed to live events");
            tokio::spawn(reply(sender.clone(), id, MeshResponse::Subscribed));
        }
        MeshMessage::Request { id, request } => {
            let replica = context.replica.clone();
            let sender = sender.clone();
            tokio::spawn(async move {
                let response = serve(&replica, request).await;
                reply(sender, id, response).await;
            });
        }
        MeshMessage::Response { id, response } => master.resolve(id, response),
        MeshMessage::Event { event } => master.deliver(PullStreamItem::Event(event)),
        MeshMessage::Resync => master.deliver(PullStreamItem::Resync),
    }
}

async fn serve(replica: &Replica, request: MeshRequest) -> MeshResponse {
    let result = match request {
        MeshRequest::Pull {
            checkpoint,
            batch_size,
        } => replica
            .pull(&checkpoint, batch_size.min(MAX_SERVED_BATCH))
            .await
            .map(|batch| MeshResponse::Pull { batch }),
        MeshRequest::Push { rows } => replica
            .push(&rows)
            .await
            .map(|conflicts| MeshResponse::Push { conflicts }),
        MeshRequest::Subscribe => Ok(MeshResponse::Subscribed),
    };
    result.unwrap_or_else(|error| MeshResponse::Error {
        message: error.to_string(),
    })
}

async fn reply(sender: mpsc::Sender<String>, id: u64, response: MeshResponse) {
    if let Err(error) = send_message(&sender, &MeshMessage::Response { id, response }).await {
        debug!(%error, id, "Could not deliver response");
    }
}

async fn send_message(sender: &mpsc::Sender<String>, message: &MeshMessage) -> Result<()> {
    let frame = message.to_frame()?;
    sender.send(frame).await.map_err(|_| Error::Closed)
}

/// Forward local writes to a subscribed peer without positions.
async fn forward_events(mut subscription: Subscription, sender: mpsc::Sender<String>) {
    while let Some(item) = subscription.recv().await {
        let message = match item {
            PullStreamItem::Event(event) => MeshMessage::Event {
                event: event.without_checkpoint(),
            },
            PullStreamItem::Resync => MeshMessage::Resync,
        };
        if send_message(&sender, &message).await.is_err() {
            break;
        }
    }
}

async fn watch_status(mut in_sync: watch::Receiver<bool>, board: StatusBoard, peer: PeerId) {
    while in_sync.changed().await.is_ok() {
        let status = if *in_sync.borrow_and_update() {
            PeerStatus::InSync
        } else {
            PeerStatus::Syncing
        };
        board.set(&peer, status);
    }
}

async fn relay_errors(
    mut errors: broadcast::Receiver<String>,
    context: PeerContext,
    peer: PeerId,
) {
    loop {
        match errors.recv().await {
            Ok(message) => context.report(&peer, &message),
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// A connected peer seen as a replication master.
#[derive(Clone)]
struct PeerMaster {
    inner: Arc<PeerLink>,
}

struct PeerLink {
    outbound: mpsc::Sender<String>,
    pending: Mutex<HashMap<u64, oneshot::Sender<MeshResponse>>>,
    stream: Mutex<Option<mpsc::Sender<PullStreamItem>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    timeout: Duration,
    stream_capacity: usize,
}

impl PeerMaster {
    fn new(outbound: mpsc::Sender<String>, timeout: Duration, stream_capacity: usize) -> Self {
        Self {
            inner: Arc::new(PeerLink {
                outbound,
                pending: Mutex::new(HashMap::new()),
                stream: Mutex::new(None),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                timeout,
                stream_capacity: stream_capacity.max(1),
            }),
        }
    }

    async fn request(&self, request: MeshRequest) -> Result<MeshResponse> {
        let link = &self.inner;
        if link.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        let id = link.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = MeshMessage::Request { id, request }.to_frame()?;
        let (tx, rx) = oneshot::channel();
        lock(&link.pending).insert(id, tx);

        if link.outbound.send(frame).await.is_err() {
            lock(&link.pending).remove(&id);
            return Err(Error::Closed);
        }

        match tokio::time::timeout(link.timeout, rx).await {
            Ok(Ok(MeshResponse::Error { message })) => Err(Error::Remote(message)),
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::Closed),
            Err(_) => {
                lock(&link.pending).remove(&id);
                Err(Error::Timeout)
            }
        }
    }

    fn resolve(&self, id: u64, response: MeshResponse) {
        let waiter = lock(&self.inner.pending).remove(&id);
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(response);
            }
            None => debug!(id, "Dropping response to unknown request"),
        }
    }

    /// Hand a live item to the open stream. A stream that cannot keep up is
    /// closed, which makes the replication loop resync.
    fn deliver(&self, item: PullStreamItem) {
        let mut stream = lock(&self.inner.stream);
        let Some(tx) = stream.as_ref() else {
            return;
        };
        match tx.try_send(item) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Peer stream lagging, forcing resync");
                *stream = None;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => *stream = None,
        }
    }

    fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        lock(&self.inner.pending).clear();
        *lock(&self.inner.stream) = None;
    }
}

fn unexpected(response: &MeshResponse) -> Error {
    Error::Remote(format!("unexpected response: {response:?}"))
}

impl ReplicationMaster for PeerMaster {
    /// Transient failures echo the checkpoint with no documents.
    async fn pull(&self, checkpoint: &Checkpoint, batch_size: usize) -> Result<PullBatch> {
        let request = MeshRequest::Pull {
            checkpoint: checkpoint.clone(),
            batch_size,
        };
        match self.request(request).await {
            Ok(MeshResponse::Pull { batch }) => Ok(batch),
            Ok(other) => Err(unexpected(&other)),
            Err(Error::Closed) => Err(Error::Closed),
            Err(error) => {
                warn!(%error, "Pull from peer failed, keeping checkpoint");
                Ok(PullBatch::empty(checkpoint.clone()))
            }
        }
    }

    async fn push(&self, rows: &[PushRow]) -> Result<Vec<Todo>> {
        let request = MeshRequest::Push {
            rows: rows.to_vec(),
        };
        match self.request(request).await? {
            MeshResponse::Push { conflicts } => Ok(conflicts),
            other => Err(unexpected(&other)),
        }
    }

    async fn stream(&self) -> Result<PullStream> {
        let (tx, rx) = mpsc::channel(self.inner.stream_capacity);
        *lock(&self.inner.stream) = Some(tx);
        match self.request(MeshRequest::Subscribe).await? {
            MeshResponse::Subscribed => Ok(rx),
            other => Err(unexpected(&other)),
        }
    }
}
