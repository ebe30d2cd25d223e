//! Replication protocol: exchange, conflict resolution, live fan-out, and
//! the client loop that ties them to a master.

mod conflict;
pub mod exchange;
mod master;
mod notifier;
mod state;

pub use conflict::{ConflictHandler, LastWriteWins};
pub use exchange::{PushOutcome, DEFAULT_BATCH_SIZE};
pub use master::{PullStream, ReplicationMaster};
pub use notifier::{LiveNotifier, Subscription, DEFAULT_SUBSCRIBER_CAPACITY};
pub use state::ReplicationState;
