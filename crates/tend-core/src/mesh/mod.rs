//! Peer-to-peer replication inside a room

mod protocol;
mod room;
mod session;
mod transport;

pub use protocol::{MeshMessage, MeshRequest, MeshResponse};
pub use room::{RoomId, RoomToken, MIN_TOKEN_LEN};
pub use session::{MeshSession, PeerState, PeerStatus};
pub use transport::{
    MemoryHub, MeshTransport, PeerChannel, PeerId, TransportEvent, TransportEvents,
};
