//! The remote side of a replication relationship

use std::future::Future;

use tokio::sync::mpsc;

use crate::models::{Checkpoint, PullBatch, PullStreamItem, PushRow, Todo};
use crate::services::Replica;
use crate::Result;

/// Live items delivered by a master. The stream ends when the connection
/// does; callers treat the end like a [`PullStreamItem::Resync`].
pub type PullStream = mpsc::Receiver<PullStreamItem>;

const STREAM_BUFFER: usize = 64;

/// A replica this one pulls from and pushes to.
///
/// Implemented by the HTTP client, by mesh peers, and by [`Replica`] itself
/// for in-process replication.
pub trait ReplicationMaster: Send + Sync + 'static {
    /// Records after `checkpoint`, at most `batch_size`.
    fn pull(
        &self,
        checkpoint: &Checkpoint,
        batch_size: usize,
    ) -> impl Future<Output = Result<PullBatch>> + Send;

    /// Propose writes; returns the master's state for every conflicting row.
    fn push(&self, rows: &[PushRow]) -> impl Future<Output = Result<Vec<Todo>>> + Send;

    /// Follow writes accepted by the master.
    fn stream(&self) -> impl Future<Output = Result<PullStream>> + Send;
}

impl ReplicationMaster for Replica {
    async fn pull(&self, checkpoint: &Checkpoint, batch_size: usize) -> Result<PullBatch> {
        Self::pull(self, checkpoint, batch_size).await
    }

    async fn push(&self, rows: &[PushRow]) -> Result<Vec<Todo>> {
        Self::push(self, rows).await
    }

    async fn stream(&self) -> Result<PullStream> {
        let mut subscription = self.subscribe();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        // Ends with the subscription or as soon as the reader goes away,
        // so an abandoned stream unsubscribes without waiting for a write.
        tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    biased;
                    () = tx.closed() => break,
                    item = subscription.recv() => item,
                };
                let Some(item) = item else { break };
                if tx.send(item).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}
