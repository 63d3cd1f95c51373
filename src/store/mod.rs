//! Snapshot persistence: a best-effort cache of fetched project trees keyed by
//! repository and branch, backed by a local SQLite database.

pub mod snapshot;

pub use snapshot::{
    CacheEntry, CacheKey, MemorySnapshotStore, SnapshotCache, SnapshotStore, SqliteSnapshotStore,
};

use anyhow::Result;
use rusqlite::Connection;
use std::path::Path;

/// Open the snapshot database and create tables if needed.
pub fn init_db(db_path: &Path) -> Result<Connection> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

pub(crate) fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;

         CREATE TABLE IF NOT EXISTS snapshot_cache (
             key TEXT PRIMARY KEY,
             tree TEXT NOT NULL,
             stored_at TEXT NOT NULL
         );",
    )?;
    Ok(())
}
