//! Queue client: credential-rotating request orchestration
//!
//! A `QueueClient` runs logical requests against one queue (rate-limit
//! bucket). It claims a credential from the `CredentialStore`, builds a
//! transport from its session material, signs each request with the
//! credential's transaction token generator and classifies every response
//! to decide whether to return it, rotate to another credential, retry on
//! the same one, or abort.
//!
//! Request lifecycle:
//! 1. No context → wait for (or fail fast on) a claimable credential
//! 2. Send with a cached token; on 404 retry with fresh generators, bounded
//! 3. Classify: rate limit → lock until reset; ban/auth failure → deactivate;
//!    dependency failure without data → abort; otherwise return the response
//! 4. Transient transport failures retry on the same credential with backoff
//! 5. `close()` (or drop) releases the credential back to the pool

pub mod classify;
pub mod client;
pub mod cursor;
pub mod error;
pub mod metrics;
pub mod options;

pub use classify::{Verdict, classify};
pub use client::QueueClient;
pub use cursor::{CursorState, CursorStats, CursorStore};
pub use error::{Error, Result};
pub use options::{ClientOptions, RetryPolicy};
