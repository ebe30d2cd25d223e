use std::path::Path;

use tend_core::{HttpMaster, ReplicationConfig, ReplicationState};

use crate::commands::common::open_replica;
use crate::error::CliError;

/// One catch-up cycle: pull until nothing is left, then push local changes.
pub async fn run_sync(server_url: &str, db_path: &Path) -> Result<(), CliError> {
    let replica = open_replica(db_path)?;
    let config = ReplicationConfig {
        live: false,
        ..ReplicationConfig::default()
    };
    let master = HttpMaster::with_timeout(server_url, config.request_timeout())?;

    tracing::info!(server = %server_url, "Starting one-shot sync");
    let state = ReplicationState::start(replica.clone(), master, config)?;
    let outcome = state.await_in_sync().await;
    state.cancel().await;

    if let Err(error) = outcome {
        let message = match error {
            tend_core::Error::Replication(message) => message,
            tend_core::Error::Closed => "changes are still pending".to_string(),
            other => other.to_string(),
        };
        return Err(CliError::SyncFailed(message));
    }

    println!("Sync completed ({} todos)", replica.list().await?.len());
    Ok(())
}
