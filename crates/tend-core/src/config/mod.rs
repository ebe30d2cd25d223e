//! Replication configuration shared by the HTTP client loop and the mesh.
//!
//! Both structs deserialize with every field optional so that a partial
//! JSON or TOML table only overrides what it names.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::replication::{DEFAULT_BATCH_SIZE, DEFAULT_SUBSCRIBER_CAPACITY};
use crate::{Error, Result};

/// Replication identifier used for the HTTP server relationship
pub const DEFAULT_REPLICATION_IDENTIFIER: &str = "http-todos";

const DEFAULT_RETRY_INTERVAL_MS: u64 = 5_000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

/// Settings of one replication relationship.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ReplicationConfig {
    /// Key under which checkpoint and assumed master states are stored
    pub identifier: String,
    pub pull_batch_size: usize,
    pub push_batch_size: usize,
    pub retry_interval_ms: u64,
    pub request_timeout_ms: u64,
    /// Keep following the master after the initial sync
    pub live: bool,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            identifier: DEFAULT_REPLICATION_IDENTIFIER.to_string(),
            pull_batch_size: DEFAULT_BATCH_SIZE,
            push_batch_size: DEFAULT_BATCH_SIZE,
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            live: true,
        }
    }
}

impl ReplicationConfig {
    /// A default config under another identifier.
    pub fn with_identifier(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            ..Self::default()
        }
    }

    pub const fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Reject values the replication loop cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.identifier.trim().is_empty() {
            return Err(Error::InvalidInput(
                "replication identifier must not be empty".to_string(),
            ));
        }
        if self.pull_batch_size == 0 || self.push_batch_size == 0 {
            return Err(Error::InvalidInput(
                "batch sizes must be greater than zero".to_string(),
            ));
        }
        if self.retry_interval_ms == 0 || self.request_timeout_ms == 0 {
            return Err(Error::InvalidInput(
                "retry interval and request timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Settings of a peer mesh session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct MeshConfig {
    /// Per-peer queue of live events forwarded to that peer
    pub subscriber_capacity: usize,
    pub request_timeout_ms: u64,
    /// Template for each peer's replication; the identifier becomes
    /// `<prefix>-<peer id>`
    pub replication: ReplicationConfig,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            replication: ReplicationConfig::with_identifier("mesh"),
        }
    }
}

impl MeshConfig {
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Replication settings for the relationship with one peer.
    pub fn replication_for(&self, peer: &str) -> ReplicationConfig {
        ReplicationConfig {
            identifier: format!("{}-{peer}", self.replication.identifier),
            request_timeout_ms: self.request_timeout_ms,
            ..self.replication.clone()
        }
    }
}

/// Trim a server base URL and require an http(s) scheme.
pub fn normalize_base_url(raw: &str) -> Result<String> {
    let url = raw.trim();
    if url.is_empty() {
        return Err(Error::InvalidInput(
            "server URL must not be empty".to_string(),
        ));
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(url.trim_end_matches('/').to_string())
    } else {
        Err(Error::InvalidInput(
            "server URL must include http:// or https://".to_string(),
        ))
    }
}
