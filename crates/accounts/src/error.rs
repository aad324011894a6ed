//! Error types for credential store operations

/// Errors from credential store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("store parse error: {0}")]
    Parse(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Another process held the store for every retry.
    #[error("store busy: {0}")]
    Busy(String),

    #[error("invalid account line: {0}")]
    Import(String),
}

impl From<common::Error> for Error {
    fn from(e: common::Error) -> Self {
        match e {
            common::Error::Busy(path) => Error::Busy(path),
            common::Error::Json(e) => Error::Parse(format!("serializing store: {e}")),
            other => Error::Io(other.to_string()),
        }
    }
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;
