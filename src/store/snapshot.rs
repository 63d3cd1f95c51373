//! Project snapshot cache: the last fetched tree per repository and branch,
//! stored as JSON so a later boot can mount it without waiting on the network.
//!
//! Entries are overwritten on every fetch and never expire. Storage is
//! best-effort: [`SnapshotCache`] turns every backend failure into a miss.

use crate::tree::FileSystemTree;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Branch segment used when no branch is given.
pub const DEFAULT_BRANCH_KEY: &str = "default";

/// `"{repository}:{branch}"`, with a missing or blank branch as `default`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(repository_id: &str, branch: Option<&str>) -> Self {
        let branch = branch
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .unwrap_or(DEFAULT_BRANCH_KEY);
        Self(format!("{repository_id}:{branch}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub tree: FileSystemTree,
    pub stored_at: DateTime<Utc>,
}

/// Raw persistent key/value backend. Failures are expected and normal.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

    async fn set(&self, entry: &CacheEntry) -> Result<()>;
}

// ── SQLite backend ──────────────────────────────────────────────────────────────

pub struct SqliteSnapshotStore {
    conn: Mutex<Connection>,
}

impl SqliteSnapshotStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(super::init_db(db_path)?),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        super::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait]
impl SnapshotStore for SqliteSnapshotStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let row = {
            let conn = self.conn.lock();
            let mut stmt =
                conn.prepare("SELECT tree, stored_at FROM snapshot_cache WHERE key = ?1")?;
            stmt.query_row(params![key], |row| {
                let tree_json: String = row.get(0)?;
                let stored_at: String = row.get(1)?;
                Ok((tree_json, stored_at))
            })
            .optional()?
        };

        let Some((tree_json, stored_at)) = row else {
            return Ok(None);
        };
        let tree: FileSystemTree = serde_json::from_str(&tree_json)
            .map_err(|e| anyhow::anyhow!("Failed to deserialize snapshot {key}: {e}"))?;
        let stored_at = DateTime::parse_from_rfc3339(&stored_at)
            .map_err(|e| anyhow::anyhow!("Bad timestamp on snapshot {key}: {e}"))?
            .with_timezone(&Utc);

        Ok(Some(CacheEntry {
            key: key.to_string(),
            tree,
            stored_at,
        }))
    }

    async fn set(&self, entry: &CacheEntry) -> Result<()> {
        let tree_json = serde_json::to_string(&entry.tree)
            .map_err(|e| anyhow::anyhow!("Failed to serialize snapshot: {e}"))?;

        self.conn.lock().execute(
            "INSERT INTO snapshot_cache (key, tree, stored_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
                 tree = excluded.tree,
                 stored_at = excluded.stored_at",
            params![entry.key, tree_json, entry.stored_at.to_rfc3339()],
        )?;
        Ok(())
    }
}

// ── In-memory backend ───────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemorySnapshotStore {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set(&self, entry: &CacheEntry) -> Result<()> {
        self.entries
            .lock()
            .insert(entry.key.clone(), entry.clone());
        Ok(())
    }
}

// ── Best-effort front ───────────────────────────────────────────────────────────

/// Cache front used by the orchestrator. Absent storage and storage errors
/// both read as a miss; failed writes are dropped.
#[derive(Clone, Default)]
pub struct SnapshotCache {
    store: Option<Arc<dyn SnapshotStore>>,
}

impl SnapshotCache {
    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        Self { store: Some(store) }
    }

    pub fn disabled() -> Self {
        Self { store: None }
    }

    pub async fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let store = self.store.as_ref()?;
        match store.get(key.as_str()).await {
            Ok(Some(entry)) => {
                tracing::debug!("Snapshot cache hit for {key} (stored {})", entry.stored_at);
                Some(entry)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("Snapshot cache read failed for {key}, treating as miss: {e:#}");
                None
            }
        }
    }

    pub async fn set(&self, key: &CacheKey, tree: &FileSystemTree) {
        let Some(store) = &self.store else {
            return;
        };
        let entry = CacheEntry {
            key: key.to_string(),
            tree: tree.clone(),
            stored_at: Utc::now(),
        };
        if let Err(e) = store.set(&entry).await {
            tracing::warn!("Snapshot cache write failed for {key}: {e:#}");
        }
    }
}
