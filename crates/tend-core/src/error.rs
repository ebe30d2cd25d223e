//! Error types for tend-core

use thiserror::Error;

/// Result type alias using tend-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tend-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Todo not found
    #[error("Todo not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A record was rejected by the validator before reaching a store
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The remote replica answered with a failure
    #[error("Remote error: {0}")]
    Remote(String),

    /// Peer channel error
    #[error("Transport error: {0}")]
    Transport(String),

    /// A one-shot replication ended without reaching sync
    #[error("Replication failed: {0}")]
    Replication(String),

    /// A bounded network call ran out of time
    #[error("Request timed out")]
    Timeout,

    /// The replica (or the channel to it) has been shut down
    #[error("Replica is closed")]
    Closed,
}
