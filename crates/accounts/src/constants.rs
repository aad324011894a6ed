//! Credential store defaults
//!
//! Every value here is only a default; `StoreOptions` carries the effective
//! values and is loaded from the `[store]` config section.

/// Schema version written to the store file. Files with a higher version
/// were written by a newer build and are refused.
pub const STORE_VERSION: u32 = 1;

/// Provisional lock applied by `claim` so a crashed session's credential
/// becomes claimable again on its own.
pub const DEFAULT_CLAIM_WINDOW_SECS: u64 = 15 * 60;

/// Attempts to take the store lock file before giving up with `Busy`.
pub const DEFAULT_BUSY_RETRIES: u32 = 10;

/// Randomized backoff range between lock file attempts.
pub const DEFAULT_BUSY_BACKOFF_MIN_MS: u64 = 50;
pub const DEFAULT_BUSY_BACKOFF_MAX_MS: u64 = 250;

/// Lock files older than this were left by a dead process.
pub const DEFAULT_STALE_LOCK_SECS: u64 = 30;

/// Length `error_msg` is cut to in account listings.
pub const ERROR_MSG_PREVIEW_CHARS: usize = 60;
