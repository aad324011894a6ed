//! Error types for token generation

/// Errors from building a token generator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("verification key: {0}")]
    VerificationKey(String),

    #[error("on-demand script: {0}")]
    Script(String),

    #[error("animation frames: {0}")]
    Animation(String),
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e.to_string())
    }
}

/// Result alias for token generation.
pub type Result<T> = std::result::Result<T, Error>;
