//! Queue client options, loaded from the `[client]` config section

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default seconds between claim attempts while waiting for a credential.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// Default attempts per logical request: one cached token plus fresh ones.
pub const DEFAULT_TOKEN_ATTEMPTS: u32 = 3;

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// Wait for a credential to free up instead of failing with `NoAccount`.
    pub wait_for_account: bool,
    pub poll_interval_secs: u64,
    pub token_attempts: u32,
    /// Lock the credential this long on an unexpected non-success status.
    /// Off when unset.
    pub unhandled_status_lock_secs: Option<u64>,
    pub request_timeout_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            wait_for_account: true,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            token_attempts: DEFAULT_TOKEN_ATTEMPTS,
            unhandled_status_lock_secs: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            retry: RetryPolicy::default(),
        }
    }
}

impl ClientOptions {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Bounded exponential backoff for transient failures on one credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    /// Upper bound of the delay before retry number `retry` (1-based):
    /// base doubled per retry, capped.
    pub fn ceiling(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(31);
        let ms = self
            .base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Jittered delay in `[ceiling / 2, ceiling]`.
    pub fn delay(&self, retry: u32) -> Duration {
        let ceiling = self.ceiling(retry);
        common::fs::jitter(ceiling / 2, ceiling)
    }
}
