//! Credential pool library
//!
//! Persistent bookkeeping of the session credentials a queue client rotates
//! through: which credentials exist, whether they are healthy, and until when
//! each one is locked for each queue (rate-limit bucket). This crate never
//! authenticates anything; credentials arrive with their session material
//! already populated, either added directly or imported from an account file.
//!
//! Lifecycle of a credential inside one orchestration session:
//! 1. `CredentialStore::claim()` picks an available credential and marks it
//!    provisionally locked for the queue
//! 2. The caller builds a transport from its headers/cookies
//! 3. On a clean end `release()` unlocks it and adds the request count
//! 4. On a rate limit `lock_until()` parks it until the reset time
//! 5. On a ban or dead session `deactivate()` takes it out of rotation

pub mod constants;
pub mod credentials;
pub mod error;
pub mod import;
pub mod store;

pub use constants::*;
pub use credentials::{AccountInfo, Credential, PoolStats};
pub use error::{Error, Result};
pub use import::{ImportReport, LineError, load_account_file, parse_account_line};
pub use store::{CredentialStore, StoreOptions};
