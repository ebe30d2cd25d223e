use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] tend_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Todo name cannot be empty")]
    EmptyName,
    #[error("Todo ID cannot be empty")]
    EmptyTodoId,
    #[error("Todo not found for id/prefix: {0}")]
    TodoNotFound(String),
    #[error("{0}")]
    AmbiguousTodoId(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("No server configured. Pass --server or set TEND_SERVER_URL.")]
    ServerNotConfigured,
    #[error("Replication did not complete: {0}")]
    SyncFailed(String),
}
