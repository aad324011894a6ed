//! Wall-clock abstraction
//!
//! Lock windows and rate-limit resets are unix timestamps, so every component
//! that compares against "now" reads it through a `Clock`. Production code uses
//! `SystemClock`; tests drive `ManualClock` to simulate time passing.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of the current unix time.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current unix time in milliseconds.
    fn now_millis(&self) -> i64;

    /// Current unix time in whole seconds.
    fn now(&self) -> i64 {
        self.now_millis().div_euclid(1000)
    }
}

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    /// Start at the given unix time in seconds.
    pub fn at(secs: i64) -> Self {
        Self {
            millis: AtomicI64::new(secs * 1000),
        }
    }

    /// Jump to the given unix time in seconds.
    pub fn set(&self, secs: i64) {
        self.millis.store(secs * 1000, Ordering::SeqCst);
    }

    /// Move forward by `secs` seconds.
    pub fn advance(&self, secs: i64) {
        self.millis.fetch_add(secs * 1000, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_is_after_2023() {
        let secs = SystemClock.now();
        let millis = SystemClock.now_millis();
        assert!(secs > 1_682_924_400);
        assert!(millis / 1000 - secs <= 1);
    }

    #[test]
    fn manual_clock_moves_only_when_told() {
        let clock = ManualClock::at(1_700_000_000);
        assert_eq!(clock.now(), 1_700_000_000);
        assert_eq!(clock.now_millis(), 1_700_000_000_000);

        clock.advance(30);
        assert_eq!(clock.now(), 1_700_000_030);

        clock.set(5);
        assert_eq!(clock.now(), 5);
    }
}
