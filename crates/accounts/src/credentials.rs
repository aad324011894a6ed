//! Credential model
//!
//! A `Credential` is one authenticated identity: its session material plus
//! per-queue lock and usage bookkeeping. Every field except `username` has a
//! serde default so records written by older builds keep loading.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::ERROR_MSG_PREVIEW_CHARS;

/// One session credential as persisted in the store.
///
/// `locks` maps a queue name to a unix timestamp (seconds) before which the
/// credential must not be handed out for that queue. A missing entry or a
/// past timestamp means available.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    /// Session headers (e.g. `authorization`) replayed on every request.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Session cookies; `ct0` doubles as the CSRF token.
    #[serde(default)]
    pub cookies: BTreeMap<String, String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Proxy URL this credential must always be used through.
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub locks: BTreeMap<String, i64>,
    /// Requests served per queue.
    #[serde(default)]
    pub stats: BTreeMap<String, u64>,
    #[serde(default)]
    pub last_used: Option<i64>,
    #[serde(default)]
    pub error_msg: Option<String>,
}

fn default_active() -> bool {
    true
}

impl Credential {
    /// An active credential with no session material yet.
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            headers: BTreeMap::new(),
            cookies: BTreeMap::new(),
            user_agent: None,
            proxy: None,
            active: true,
            locks: BTreeMap::new(),
            stats: BTreeMap::new(),
            last_used: None,
            error_msg: None,
        }
    }

    /// Whether `claim(queue)` may hand this credential out at `now`.
    pub fn is_available(&self, queue: &str, now: i64) -> bool {
        self.active && self.locks.get(queue).is_none_or(|until| *until <= now)
    }

    /// Lock expiry for `queue`, if one is set.
    pub fn locked_until(&self, queue: &str) -> Option<i64> {
        self.locks.get(queue).copied()
    }

    /// Whether the credential carries any session material at all.
    pub fn logged_in(&self) -> bool {
        !self.headers.is_empty() || !self.cookies.is_empty()
    }

    /// Sum of the per-queue request counters.
    pub fn total_requests(&self) -> u64 {
        self.stats.values().sum()
    }

    /// Cookies joined into a single `cookie` header value.
    pub fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        let joined = self
            .cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ");
        Some(joined)
    }
}

// Session material never reaches logs; only header/cookie names are shown.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .field("cookies", &self.cookies.keys().collect::<Vec<_>>())
            .field("proxy", &self.proxy.as_ref().map(|_| "[REDACTED]"))
            .field("active", &self.active)
            .field("locks", &self.locks)
            .field("stats", &self.stats)
            .field("last_used", &self.last_used)
            .field("error_msg", &self.error_msg)
            .finish()
    }
}

/// Aggregate pool counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub active: usize,
    pub inactive: usize,
    /// Credentials currently locked, per queue.
    pub locked: BTreeMap<String, usize>,
}

/// One row of the operator account listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountInfo {
    pub username: String,
    pub active: bool,
    pub logged_in: bool,
    pub last_used: Option<i64>,
    pub total_requests: u64,
    pub error_msg: Option<String>,
}

impl From<&Credential> for AccountInfo {
    fn from(c: &Credential) -> Self {
        Self {
            username: c.username.clone(),
            active: c.active,
            logged_in: c.logged_in(),
            last_used: c.last_used,
            total_requests: c.total_requests(),
            error_msg: c
                .error_msg
                .as_ref()
                .map(|m| m.chars().take(ERROR_MSG_PREVIEW_CHARS).collect()),
        }
    }
}
