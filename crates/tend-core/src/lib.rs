//! tend-core - Core library for tend
//!
//! This crate contains the todo records, the stores, and the replication
//! protocol shared by the API server, the CLI, and mesh peers.

pub mod config;
pub mod db;
pub mod error;
pub mod mesh;
pub mod models;
pub mod replication;
pub mod services;
pub mod sync;

pub use config::{MeshConfig, ReplicationConfig};
pub use error::{Error, Result};
pub use models::{Checkpoint, PullBatch, PullStreamItem, PushRow, ReplicationEvent, Todo, TodoId, TodoState};
pub use replication::{ReplicationMaster, ReplicationState};
pub use services::Replica;
pub use sync::HttpMaster;
