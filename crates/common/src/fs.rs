//! Crash-safe persistence helpers
//!
//! State files are rewritten whole: serialize, write a temp file in the same
//! directory, rename over the target. Processes sharing a state file take an
//! exclusive lock file next to it for the read-modify-write window; a lock
//! file that already exists means "busy" and is retried with random backoff.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::RngExt;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Write a value as pretty JSON atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Sets file permissions to 0600 (owner read/write only) since
/// state files hold session cookies.
pub async fn write_json_atomic<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(data)?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Config(format!("{} has no parent directory", path.display())))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".to_string());

    let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes()).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms).await?;
    }

    tokio::fs::rename(&tmp_path, path).await?;

    debug!(path = %path.display(), "persisted state file");
    Ok(())
}

/// Retry policy for acquiring a [`FileLock`].
#[derive(Debug, Clone)]
pub struct LockPolicy {
    /// Extra attempts after the first one fails with "busy".
    pub retries: u32,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    /// A lock file older than this was left behind by a dead process.
    pub stale_after: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            retries: 10,
            backoff_min: Duration::from_millis(50),
            backoff_max: Duration::from_millis(250),
            stale_after: Duration::from_secs(30),
        }
    }
}

/// Exclusive inter-process lock backed by a `create_new` lock file.
///
/// The file holds a token unique to this holder. Released (file removed) on
/// drop, but only while the file still carries that token.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    token: String,
}

impl FileLock {
    /// Lock file path used for a given state file.
    pub fn path_for(state_path: &Path) -> PathBuf {
        suffixed(state_path, ".lock")
    }

    /// Acquire the lock, retrying with random backoff while another holder
    /// has it. Returns `Error::Busy` when retries run out.
    pub async fn acquire(path: PathBuf, policy: &LockPolicy) -> Result<Self> {
        let token = format!("{}:{:016x}", std::process::id(), rand::rng().random::<u64>());
        let mut attempt = 0u32;
        loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    file.write_all(token.as_bytes()).await?;
                    file.flush().await?;
                    return Ok(Self { path, token });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if is_stale(&path, policy.stale_after).await
                        && reclaim(&path, policy.stale_after).await?
                    {
                        continue;
                    }
                    if attempt >= policy.retries {
                        break;
                    }
                    attempt += 1;
                    let delay = jitter(policy.backoff_min, policy.backoff_max);
                    debug!(
                        path = %path.display(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "state file busy, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::Busy(path.display().to_string()))
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) if contents == self.token => {
                if let Err(e) = std::fs::remove_file(&self.path) {
                    warn!(path = %self.path.display(), error = %e, "failed to remove lock file");
                }
            }
            Ok(_) => {
                warn!(path = %self.path.display(), "lock file taken over by another holder, leaving it");
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read lock file");
            }
        }
    }
}

/// Move a stale lock file out of the way.
///
/// The rename is atomic, so of several processes racing on the same stale
/// file exactly one gets it. The moved file is checked again: if it turns out
/// to be a live lock that replaced the stale one in between, it is linked
/// back in place. Returns true only when a stale lock was removed.
async fn reclaim(path: &Path, stale_after: Duration) -> Result<bool> {
    let tombstone = suffixed(path, &format!(".stale.{:016x}", rand::rng().random::<u64>()));
    match tokio::fs::rename(path, &tombstone).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    }

    let stale = is_stale(&tombstone, stale_after).await;
    if stale {
        warn!(path = %path.display(), "removed stale lock file");
    } else {
        match tokio::fs::hard_link(&tombstone, path).await {
            Ok(()) => debug!(path = %path.display(), "restored live lock file"),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                warn!(path = %path.display(), "lock file replaced while restoring a live lock");
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&tombstone).await;
                return Err(e.into());
            }
        }
    }
    if let Err(e) = tokio::fs::remove_file(&tombstone).await {
        warn!(path = %tombstone.display(), error = %e, "failed to remove lock tombstone");
    }
    Ok(stale)
}

async fn is_stale(path: &Path, stale_after: Duration) -> bool {
    let Ok(metadata) = tokio::fs::metadata(path).await else {
        return false;
    };
    metadata
        .modified()
        .ok()
        .and_then(|m| m.elapsed().ok())
        .is_some_and(|age| age > stale_after)
}

fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Uniformly random duration in `[min, max]`.
pub fn jitter(min: Duration, max: Duration) -> Duration {
    let lo = min.as_millis() as u64;
    let hi = max.as_millis() as u64;
    if hi <= lo {
        return min;
    }
    Duration::from_millis(rand::rng().random_range(lo..=hi))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn quick_policy(retries: u32) -> LockPolicy {
        LockPolicy {
            retries,
            backoff_min: Duration::from_millis(1),
            backoff_max: Duration::from_millis(5),
            stale_after: Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn write_json_atomic_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut data = BTreeMap::new();
        data.insert("a".to_string(), 1u32);
        write_json_atomic(&path, &data).await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: BTreeMap<String, u32> = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed, data);

        // No temp files left behind
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn written_file_is_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        write_json_atomic(&path, &serde_json::json!({})).await.unwrap();

        let mode = tokio::fs::metadata(&path).await.unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "state file must be 0600, got {mode:o}");
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = FileLock::path_for(&dir.path().join("state.json"));

        let held = FileLock::acquire(lock_path.clone(), &quick_policy(0))
            .await
            .unwrap();
        assert!(lock_path.exists());

        let err = FileLock::acquire(lock_path.clone(), &quick_policy(2))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Busy(_)), "got {err:?}");

        drop(held);
        assert!(!lock_path.exists());
        FileLock::acquire(lock_path, &quick_policy(0)).await.unwrap();
    }

    #[tokio::test]
    async fn lock_waits_for_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = FileLock::path_for(&dir.path().join("state.json"));

        let held = FileLock::acquire(lock_path.clone(), &quick_policy(0))
            .await
            .unwrap();
        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(held);
        });

        let policy = LockPolicy {
            retries: 50,
            ..quick_policy(0)
        };
        FileLock::acquire(lock_path, &policy).await.unwrap();
        releaser.await.unwrap();
    }

    #[tokio::test]
    async fn stale_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = FileLock::path_for(&dir.path().join("state.json"));
        std::fs::write(&lock_path, b"").unwrap();

        let policy = LockPolicy {
            stale_after: Duration::ZERO,
            ..quick_policy(0)
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let lock = FileLock::acquire(lock_path.clone(), &policy).await.unwrap();
        assert_eq!(std::fs::read_to_string(&lock_path).unwrap(), lock.token);
        assert_eq!(dir_names(dir.path()), vec!["state.json.lock"]);
    }

    fn backdate(path: &Path) {
        std::fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(std::time::SystemTime::now() - Duration::from_secs(3600))
            .unwrap();
    }

    fn dir_names(dir: &Path) -> Vec<String> {
        let mut names: Vec<_> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_reclaimers_get_one_holder() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = FileLock::path_for(&dir.path().join("state.json"));
        std::fs::write(&lock_path, b"dead:0").unwrap();
        backdate(&lock_path);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let path = lock_path.clone();
                tokio::spawn(async move { FileLock::acquire(path, &quick_policy(0)).await })
            })
            .collect();
        let mut holders = Vec::new();
        for task in tasks {
            match task.await.unwrap() {
                Ok(lock) => holders.push(lock),
                Err(e) => assert!(matches!(e, Error::Busy(_)), "got {e:?}"),
            }
        }

        assert_eq!(holders.len(), 1);
        assert_eq!(
            std::fs::read_to_string(&lock_path).unwrap(),
            holders[0].token
        );
        assert_eq!(dir_names(dir.path()), vec!["state.json.lock"]);
    }

    #[tokio::test]
    async fn reclaim_restores_a_live_lock() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = FileLock::path_for(&dir.path().join("state.json"));
        let held = FileLock::acquire(lock_path.clone(), &quick_policy(0))
            .await
            .unwrap();

        // A racer that saw the previous, stale file moves the fresh one aside
        let removed = reclaim(&lock_path, Duration::from_secs(30)).await.unwrap();
        assert!(!removed);
        assert_eq!(std::fs::read_to_string(&lock_path).unwrap(), held.token);
        assert_eq!(dir_names(dir.path()), vec!["state.json.lock"]);

        let err = FileLock::acquire(lock_path.clone(), &quick_policy(0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Busy(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn drop_leaves_a_lock_it_no_longer_owns() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = FileLock::path_for(&dir.path().join("state.json"));
        let held = FileLock::acquire(lock_path.clone(), &quick_policy(0))
            .await
            .unwrap();

        std::fs::write(&lock_path, b"other:1").unwrap();
        drop(held);
        assert_eq!(std::fs::read_to_string(&lock_path).unwrap(), "other:1");
    }

    #[test]
    fn lock_path_appends_suffix() {
        let p = FileLock::path_for(Path::new("/tmp/accounts.json"));
        assert_eq!(p, PathBuf::from("/tmp/accounts.json.lock"));
    }

    #[test]
    fn jitter_stays_in_range() {
        for _ in 0..100 {
            let d = jitter(Duration::from_millis(10), Duration::from_millis(20));
            assert!(d >= Duration::from_millis(10) && d <= Duration::from_millis(20));
        }
        assert_eq!(
            jitter(Duration::from_millis(7), Duration::from_millis(3)),
            Duration::from_millis(7)
        );
    }
}
