//! Error types for queue client operations

/// Errors surfaced to the caller of a queue client.
///
/// Rate limits, bans, stale tokens and store contention are absorbed inside
/// the client and never show up here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No credential could be claimed and waiting is disabled.
    #[error("no account available for queue {0}")]
    NoAccount(String),

    #[error("credential store error: {0}")]
    Store(String),

    /// Transport failure that survived the retry policy, or a request that
    /// cannot be sent at all.
    #[error("transport error: {0}")]
    Transport(String),

    /// Token generator could not be built within the retry policy.
    #[error("token generator error: {0}")]
    Token(String),

    #[error("cursor store error: {0}")]
    Cursor(String),
}

impl From<accounts::Error> for Error {
    fn from(e: accounts::Error) -> Self {
        Error::Store(e.to_string())
    }
}

/// Result alias for queue client operations.
pub type Result<T> = std::result::Result<T, Error>;
