//! Peer discovery and text channels between peers of a room.
//!
//! How peers actually find each other is left to the transport; the mesh
//! only needs membership events and a bidirectional frame channel per peer.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use super::room::RoomId;
use crate::{Error, Result};

const FRAME_BUFFER: usize = 256;

/// Identifies one member of a room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new() -> Self {
        let mut id = Uuid::new_v4().simple().to_string();
        id.truncate(8);
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Text frames to and from one peer. Either side closing ends the channel.
#[derive(Debug)]
pub struct PeerChannel {
    pub sender: mpsc::Sender<String>,
    pub receiver: mpsc::Receiver<String>,
}

impl PeerChannel {
    /// Two connected ends.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(FRAME_BUFFER);
        let (b_tx, b_rx) = mpsc::channel(FRAME_BUFFER);
        (
            Self {
                sender: a_tx,
                receiver: b_rx,
            },
            Self {
                sender: b_tx,
                receiver: a_rx,
            },
        )
    }
}

/// Membership changes seen by a room member
#[derive(Debug)]
pub enum TransportEvent {
    PeerConnected { peer: PeerId, channel: PeerChannel },
    PeerDisconnected { peer: PeerId },
}

pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Joins rooms and hands out peer channels.
pub trait MeshTransport: Send + Sync + 'static {
    /// Announce `peer` in `room`. Existing and future members show up as
    /// [`TransportEvent::PeerConnected`] on the returned receiver.
    fn join(
        &self,
        room: &RoomId,
        peer: &PeerId,
    ) -> impl Future<Output = Result<TransportEvents>> + Send;

    /// Leave `room`; the other members see `PeerDisconnected`.
    fn leave(&self, room: &RoomId, peer: &PeerId) -> impl Future<Output = ()> + Send;
}

/// In-process transport connecting every member of a room pairwise.
#[derive(Clone, Default)]
pub struct MemoryHub {
    rooms: Arc<Mutex<HashMap<RoomId, BTreeMap<PeerId, mpsc::UnboundedSender<TransportEvent>>>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MeshTransport for MemoryHub {
    async fn join(&self, room: &RoomId, peer: &PeerId) -> Result<TransportEvents> {
        let mut rooms = self.rooms.lock().await;
        let members = rooms.entry(room.clone()).or_default();
        if members.contains_key(peer) {
            return Err(Error::Transport(format!(
                "peer {peer} already joined room {room}"
            )));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        members.retain(|other, other_events| {
            let (ours, theirs) = PeerChannel::pair();
            let delivered = other_events
                .send(TransportEvent::PeerConnected {
                    peer: peer.clone(),
                    channel: theirs,
                })
                .is_ok();
            if delivered {
                let _ = events_tx.send(TransportEvent::PeerConnected {
                    peer: other.clone(),
                    channel: ours,
                });
            }
            delivered
        });
        members.insert(peer.clone(), events_tx);
        tracing::debug!(%room, %peer, members = members.len(), "Peer joined room");
        Ok(events_rx)
    }

    async fn leave(&self, room: &RoomId, peer: &PeerId) {
        let mut rooms = self.rooms.lock().await;
        let Some(members) = rooms.get_mut(room) else {
            return;
        };
        if members.remove(peer).is_none() {
            return;
        }
        for events in members.values() {
            let _ = events.send(TransportEvent::PeerDisconnected { peer: peer.clone() });
        }
        if members.is_empty() {
            rooms.remove(room);
        }
        tracing::debug!(%room, %peer, "Peer left room");
    }
}
