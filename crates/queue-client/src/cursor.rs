//! Pagination cursor store
//!
//! Paginated streams can outlive the credential that started them: a rate
//! limit mid-stream rotates to another credential, and a process restart
//! loses the in-memory cursor. The store keeps the continuation cursor per
//! logical query on disk so the next request resumes where the last one
//! stopped, whichever credential serves it.
//!
//! Entries are keyed by `query_hash(query, params)`. The file is owned by a
//! single process; it is rewritten atomically after every change.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::{Clock, SystemClock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Stable key for a query and its parameters.
///
/// Parameters are serialized from a sorted map, so insertion order does not
/// change the key.
pub fn query_hash(query: &str, params: &BTreeMap<String, Value>) -> String {
    let params = serde_json::to_string(params).unwrap_or_default();
    let digest = Sha256::digest(format!("{query}:{params}").as_bytes());
    format!("{digest:x}")
}

/// Progress of one paginated query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorState {
    pub query: String,
    pub cursor: Option<String>,
    pub items_fetched: u64,
    /// Credential that served the most recent page.
    pub last_account: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CursorStats {
    pub total: usize,
    pub active: usize,
    pub completed: usize,
    pub total_items: u64,
}

pub struct CursorStore {
    path: PathBuf,
    clock: Arc<dyn Clock>,
    entries: Mutex<BTreeMap<String, CursorState>>,
}

impl CursorStore {
    pub async fn load(path: PathBuf) -> Result<Self> {
        Self::load_with_clock(path, Arc::new(SystemClock)).await
    }

    /// Load cursors from `path`; a missing file starts empty.
    pub async fn load_with_clock(path: PathBuf, clock: Arc<dyn Clock>) -> Result<Self> {
        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => serde_json::from_str::<BTreeMap<String, CursorState>>(&contents)
                .map_err(|e| Error::Cursor(format!("parsing {}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(Error::Cursor(format!("reading {}: {e}", path.display()))),
        };
        info!(path = %path.display(), cursors = entries.len(), "loaded cursor store");
        Ok(Self {
            path,
            clock,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self, query: &str, params: &BTreeMap<String, Value>) -> Option<CursorState> {
        self.entries
            .lock()
            .await
            .get(&query_hash(query, params))
            .cloned()
    }

    /// Cursor to resume from, or `None` when there is nothing to resume
    /// (never started, no cursor yet, or already completed).
    pub async fn cursor(&self, query: &str, params: &BTreeMap<String, Value>) -> Option<String> {
        self.get(query, params)
            .await
            .filter(|state| !state.completed)
            .and_then(|state| state.cursor)
    }

    /// Record a fetched page: store its continuation cursor and add `items`
    /// to the running count.
    pub async fn update(
        &self,
        query: &str,
        params: &BTreeMap<String, Value>,
        cursor: Option<&str>,
        items: u64,
        account: Option<&str>,
    ) -> Result<()> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        let state = entries
            .entry(query_hash(query, params))
            .or_insert_with(|| CursorState {
                query: query.to_string(),
                cursor: None,
                items_fetched: 0,
                last_account: None,
                created_at: now,
                updated_at: now,
                completed: false,
            });
        state.cursor = cursor.map(str::to_string);
        state.items_fetched += items;
        if let Some(account) = account {
            state.last_account = Some(account.to_string());
        }
        state.updated_at = now;
        debug!(query, items_fetched = state.items_fetched, "updated cursor");
        self.persist(&entries).await
    }

    /// Mark a query as fully paginated. Unknown queries are ignored.
    pub async fn mark_completed(&self, query: &str, params: &BTreeMap<String, Value>) -> Result<()> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        let Some(state) = entries.get_mut(&query_hash(query, params)) else {
            return Ok(());
        };
        state.completed = true;
        state.updated_at = now;
        info!(query, items_fetched = state.items_fetched, "pagination completed");
        self.persist(&entries).await
    }

    /// Unfinished queries, most recently updated first.
    pub async fn active(&self) -> Vec<CursorState> {
        let mut active: Vec<_> = self
            .entries
            .lock()
            .await
            .values()
            .filter(|state| !state.completed)
            .cloned()
            .collect();
        active.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        active
    }

    /// Drop completed entries last updated more than `older_than_secs` ago.
    /// Unfinished entries are kept regardless of age.
    pub async fn cleanup(&self, older_than_secs: i64) -> Result<usize> {
        let cutoff = self.clock.now() - older_than_secs;
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, state| !(state.completed && state.updated_at < cutoff));
        let removed = before - entries.len();
        if removed > 0 {
            info!(removed, "cleaned up completed cursors");
            self.persist(&entries).await?;
        }
        Ok(removed)
    }

    pub async fn stats(&self) -> CursorStats {
        let entries = self.entries.lock().await;
        let completed = entries.values().filter(|s| s.completed).count();
        CursorStats {
            total: entries.len(),
            active: entries.len() - completed,
            completed,
            total_items: entries.values().map(|s| s.items_fetched).sum(),
        }
    }

    async fn persist(&self, entries: &BTreeMap<String, CursorState>) -> Result<()> {
        common::fs::write_json_atomic(&self.path, entries)
            .await
            .map_err(|e| Error::Cursor(e.to_string()))
    }
}
