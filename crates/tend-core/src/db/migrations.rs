//! Database migrations

use crate::error::Result;
use rusqlite::Connection;

/// Current schema version
pub const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        migrate(conn, 1, V1)?;
    }
    if version < 2 {
        migrate(conn, 2, V2)?;
    }

    Ok(())
}

/// Get the current schema version
pub fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

/// Version 1: todos table ordered by the replication key
const V1: &str = "
    CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER PRIMARY KEY
    );
    CREATE TABLE IF NOT EXISTS todos (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        state TEXT NOT NULL CHECK (state IN ('open', 'done')),
        last_change INTEGER NOT NULL,
        deleted INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_todos_replication ON todos(last_change, id);
    CREATE INDEX IF NOT EXISTS idx_todos_state ON todos(state, last_change);
    INSERT INTO schema_version (version) VALUES (1);
";

/// Version 2: per-replication checkpoint and assumed master states
const V2: &str = "
    CREATE TABLE IF NOT EXISTS replication_checkpoints (
        identifier TEXT PRIMARY KEY,
        updated_at INTEGER NOT NULL,
        id TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS replication_master_states (
        identifier TEXT NOT NULL,
        id TEXT NOT NULL,
        name TEXT NOT NULL,
        state TEXT NOT NULL,
        last_change INTEGER NOT NULL,
        deleted INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (identifier, id)
    );
    INSERT INTO schema_version (version) VALUES (2);
";

fn migrate(conn: &Connection, version: i32, batch: &str) -> Result<()> {
    conn.execute_batch("BEGIN TRANSACTION")?;

    if let Err(e) = conn.execute_batch(batch) {
        conn.execute_batch("ROLLBACK").ok();
        return Err(e.into());
    }

    if let Err(e) = conn.execute_batch("COMMIT") {
        conn.execute_batch("ROLLBACK").ok();
        return Err(e.into());
    }

    tracing::info!("Migrated database to version {version}");
    Ok(())
}
