//! Persistent credential store
//!
//! One JSON document holds every credential, written whole with atomic
//! temp-file + rename. A tokio Mutex serializes operations inside the
//! process; across processes every mutation takes `<path>.lock` (create-new)
//! and reloads the document before touching it, so `claim`'s select-and-mark
//! is one critical section no matter how many sessions or processes share
//! the file.
//!
//! Lock windows are unix timestamps in seconds read through the injected
//! `Clock`, which lets tests move time without sleeping.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use common::fs::{FileLock, LockPolicy, write_json_atomic};
use common::{Clock, SystemClock};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::constants::*;
use crate::credentials::{AccountInfo, Credential, PoolStats};
use crate::error::{Error, Result};

type Accounts = BTreeMap<String, Credential>;

/// Tunables for the store, loaded from the `[store]` config section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreOptions {
    /// Provisional lock `claim` puts on the queue it hands a credential out for.
    pub claim_window_secs: u64,
    pub busy_retries: u32,
    pub busy_backoff_min_ms: u64,
    pub busy_backoff_max_ms: u64,
    pub stale_lock_secs: u64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            claim_window_secs: DEFAULT_CLAIM_WINDOW_SECS,
            busy_retries: DEFAULT_BUSY_RETRIES,
            busy_backoff_min_ms: DEFAULT_BUSY_BACKOFF_MIN_MS,
            busy_backoff_max_ms: DEFAULT_BUSY_BACKOFF_MAX_MS,
            stale_lock_secs: DEFAULT_STALE_LOCK_SECS,
        }
    }
}

impl StoreOptions {
    fn lock_policy(&self) -> LockPolicy {
        LockPolicy {
            retries: self.busy_retries,
            backoff_min: Duration::from_millis(self.busy_backoff_min_ms),
            backoff_max: Duration::from_millis(self.busy_backoff_max_ms),
            stale_after: Duration::from_secs(self.stale_lock_secs),
        }
    }
}

#[derive(Deserialize)]
struct StoreDocument {
    version: u32,
    #[serde(default)]
    accounts: Accounts,
}

#[derive(Serialize)]
struct StoreDocumentRef<'a> {
    version: u32,
    accounts: &'a Accounts,
}

/// Shared, persistent credential pool.
pub struct CredentialStore {
    path: PathBuf,
    options: StoreOptions,
    clock: Arc<dyn Clock>,
    state: Mutex<Accounts>,
}

impl CredentialStore {
    /// Load the store at `path` using the system clock.
    pub async fn load(path: PathBuf, options: StoreOptions) -> Result<Self> {
        Self::load_with_clock(path, options, Arc::new(SystemClock)).await
    }

    /// Load the store at `path`, reading "now" from `clock`.
    ///
    /// A missing file is a cold start: an empty versioned document is
    /// written so other processes find the same file.
    pub async fn load_with_clock(
        path: PathBuf,
        options: StoreOptions,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| Error::Io(format!("creating store directory: {e}")))?;
        }

        let state = match read_document(&path).await? {
            Some(accounts) => {
                info!(path = %path.display(), accounts = accounts.len(), "loaded credential store");
                accounts
            }
            None => {
                info!(path = %path.display(), "store file not found, starting with empty pool");
                let accounts = Accounts::new();
                persist(&path, &accounts).await?;
                accounts
            }
        };

        Ok(Self {
            path,
            options,
            clock,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// Current unix time in seconds, as the store sees it.
    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    /// Pick the first available credential (by username) for `queue` and
    /// lock it provisionally for the claim window, as one step.
    pub async fn claim(&self, queue: &str) -> Result<Option<Credential>> {
        let window = self.options.claim_window_secs as i64;
        let claimed = self
            .mutate(|accounts, now| {
                let Some(cred) = accounts.values_mut().find(|c| c.is_available(queue, now)) else {
                    return Ok((None, false));
                };
                cred.locks.insert(queue.to_string(), now + window);
                Ok((Some(cred.clone()), true))
            })
            .await?;

        match &claimed {
            Some(cred) => debug!(username = %cred.username, queue, "claimed credential"),
            None => debug!(queue, "no credential available"),
        }
        Ok(claimed)
    }

    /// Unlock `queue` for `username` now, count the requests made and stamp
    /// last use.
    pub async fn release(&self, username: &str, queue: &str, request_count: u64) -> Result<()> {
        self.mutate(|accounts, now| {
            let cred = find_mut(accounts, username)?;
            cred.locks.insert(queue.to_string(), now);
            *cred.stats.entry(queue.to_string()).or_default() += request_count;
            cred.last_used = Some(now);
            Ok(((), true))
        })
        .await?;
        debug!(username, queue, request_count, "released credential");
        Ok(())
    }

    /// Park `username` on `queue` until `unlock_at` (unix seconds).
    pub async fn lock_until(
        &self,
        username: &str,
        queue: &str,
        unlock_at: i64,
        request_count: u64,
    ) -> Result<()> {
        self.mutate(|accounts, now| {
            let cred = find_mut(accounts, username)?;
            cred.locks.insert(queue.to_string(), unlock_at);
            *cred.stats.entry(queue.to_string()).or_default() += request_count;
            cred.last_used = Some(now);
            Ok(((), true))
        })
        .await?;
        info!(username, queue, unlock_at, "credential locked until rate limit reset");
        Ok(())
    }

    /// Take `username` out of rotation until it is re-authenticated.
    pub async fn deactivate(&self, username: &str, message: Option<&str>) -> Result<()> {
        self.mutate(|accounts, _now| {
            let cred = find_mut(accounts, username)?;
            cred.active = false;
            cred.error_msg = message.map(str::to_string);
            Ok(((), true))
        })
        .await?;
        warn!(username, error = message.unwrap_or(""), "credential deactivated");
        Ok(())
    }

    /// Earliest time any active credential is free for `queue`, clamped to
    /// now. `None` when the pool has no active credential at all.
    pub async fn next_available_at(&self, queue: &str) -> Result<Option<i64>> {
        let accounts = self.snapshot().await?;
        let now = self.clock.now();
        Ok(accounts
            .values()
            .filter(|c| c.active)
            .map(|c| c.locked_until(queue).unwrap_or(now).max(now))
            .min())
    }

    /// Claim a credential for `queue`, sleeping `poll_interval` between
    /// attempts until one frees up. Never gives up on its own; drop the
    /// future to cancel.
    pub async fn wait_for_any(&self, queue: &str, poll_interval: Duration) -> Result<Credential> {
        let mut announced = false;
        loop {
            match self.claim(queue).await {
                Ok(Some(cred)) => return Ok(cred),
                Ok(None) => {}
                Err(Error::Busy(path)) => {
                    warn!(queue, path = %path, "store busy while waiting for a credential");
                }
                Err(e) => return Err(e),
            }

            if !announced {
                match self.next_available_at(queue).await? {
                    Some(at) => info!(queue, next_available_at = at, "no credential available, waiting"),
                    None => warn!(queue, "no active credentials in pool, waiting"),
                }
                announced = true;
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Insert or replace a credential.
    pub async fn add(&self, credential: Credential) -> Result<()> {
        let username = credential.username.clone();
        self.mutate(|accounts, _now| {
            accounts.insert(credential.username.clone(), credential);
            Ok(((), true))
        })
        .await?;
        debug!(username, "added credential");
        Ok(())
    }

    /// Remove a credential. Returns it if it existed.
    pub async fn remove(&self, username: &str) -> Result<Option<Credential>> {
        let removed = self
            .mutate(|accounts, _now| {
                let removed = accounts.remove(username);
                let dirty = removed.is_some();
                Ok((removed, dirty))
            })
            .await?;
        if removed.is_some() {
            debug!(username, "removed credential");
        }
        Ok(removed)
    }

    pub async fn get(&self, username: &str) -> Result<Option<Credential>> {
        Ok(self.snapshot().await?.remove(username))
    }

    /// All credentials ordered by username.
    pub async fn list(&self) -> Result<Vec<Credential>> {
        Ok(self.snapshot().await?.into_values().collect())
    }

    /// Flip the health flag. Re-activating clears the stored error.
    pub async fn set_active(&self, username: &str, active: bool) -> Result<()> {
        self.mutate(|accounts, _now| {
            let cred = find_mut(accounts, username)?;
            cred.active = active;
            if active {
                cred.error_msg = None;
            }
            Ok(((), true))
        })
        .await?;
        info!(username, active, "credential health updated");
        Ok(())
    }

    /// Remove every inactive credential. Returns how many were removed.
    pub async fn delete_inactive(&self) -> Result<usize> {
        let removed = self
            .mutate(|accounts, _now| {
                let before = accounts.len();
                accounts.retain(|_, c| c.active);
                let removed = before - accounts.len();
                Ok((removed, removed > 0))
            })
            .await?;
        info!(removed, "deleted inactive credentials");
        Ok(removed)
    }

    /// Clear every queue lock on every credential.
    pub async fn reset_locks(&self) -> Result<()> {
        self.mutate(|accounts, _now| {
            for cred in accounts.values_mut() {
                cred.locks.clear();
            }
            Ok(((), true))
        })
        .await?;
        info!("reset all credential locks");
        Ok(())
    }

    pub async fn stats(&self) -> Result<PoolStats> {
        let accounts = self.snapshot().await?;
        let now = self.clock.now();

        let mut stats = PoolStats {
            total: accounts.len(),
            ..PoolStats::default()
        };
        for cred in accounts.values() {
            if cred.active {
                stats.active += 1;
            } else {
                stats.inactive += 1;
            }
            for (queue, until) in &cred.locks {
                if *until > now {
                    *stats.locked.entry(queue.clone()).or_default() += 1;
                }
            }
        }
        Ok(stats)
    }

    /// Operator listing: active credentials first, then by username.
    pub async fn accounts_info(&self) -> Result<Vec<AccountInfo>> {
        let accounts = self.snapshot().await?;
        let mut infos: Vec<AccountInfo> = accounts.values().map(AccountInfo::from).collect();
        infos.sort_by(|a, b| b.active.cmp(&a.active).then_with(|| a.username.cmp(&b.username)));
        Ok(infos)
    }

    /// Run `op` against the freshest on-disk state while holding both the
    /// in-process mutex and the store lock file. `op` returns its result and
    /// whether it changed anything worth writing back.
    async fn mutate<R>(
        &self,
        op: impl FnOnce(&mut Accounts, i64) -> Result<(R, bool)>,
    ) -> Result<R> {
        let mut state = self.state.lock().await;
        let lock_path = FileLock::path_for(&self.path);
        let _file_lock = FileLock::acquire(lock_path, &self.options.lock_policy())
            .await
            .inspect_err(|e| warn!(path = %self.path.display(), error = %e, "credential store busy"))?;

        if let Some(accounts) = read_document(&self.path).await? {
            *state = accounts;
        }

        let (out, dirty) = op(&mut state, self.clock.now())?;
        if dirty {
            persist(&self.path, &state).await?;
        }
        Ok(out)
    }

    /// Fresh copy of the pool for read-only operations.
    async fn snapshot(&self) -> Result<Accounts> {
        let mut state = self.state.lock().await;
        if let Some(accounts) = read_document(&self.path).await? {
            *state = accounts;
        }
        Ok(state.clone())
    }
}

fn find_mut<'a>(accounts: &'a mut Accounts, username: &str) -> Result<&'a mut Credential> {
    accounts
        .get_mut(username)
        .ok_or_else(|| Error::NotFound(format!("account {username} not in credential store")))
}

async fn read_document(path: &Path) -> Result<Option<Accounts>> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::Io(format!("reading store file: {e}"))),
    };
    let doc: StoreDocument = serde_json::from_str(&contents)
        .map_err(|e| Error::Parse(format!("parsing store file: {e}")))?;
    if doc.version > STORE_VERSION {
        return Err(Error::Parse(format!(
            "store version {} is newer than supported version {STORE_VERSION}",
            doc.version
        )));
    }
    Ok(Some(doc.accounts))
}

async fn persist(path: &Path, accounts: &Accounts) -> Result<()> {
    let doc = StoreDocumentRef {
        version: STORE_VERSION,
        accounts,
    };
    write_json_atomic(path, &doc).await?;
    Ok(())
}
