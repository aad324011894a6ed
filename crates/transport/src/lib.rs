//! Transport abstraction for authenticated upstream calls
//!
//! Defines the `Transport` trait the request orchestrator talks to and the
//! `TransportFactory` that turns a claimed credential's session material into
//! a live transport. `SessionTransportFactory` is the reqwest-backed
//! implementation; tests substitute scripted transports behind the same traits.

pub mod session;

pub use session::{SessionTransport, SessionTransportFactory};

use std::future::Future;
use std::pin::Pin;

use accounts::Credential;
use bytes::Bytes;
use reqwest::header::HeaderMap;

/// Kind of transport failure, used to decide whether a retry on the same
/// credential makes sense.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Request or read timed out
    Timeout,
    /// Could not connect (upstream or proxy)
    Connect,
    /// Connection dropped while reading the body
    Body,
    /// Anything else (bad URL, builder error, invalid proxy)
    Other,
}

/// Errors from transport operations.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Timeouts, connect failures and dropped bodies are worth retrying on
    /// the same credential.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            TransportErrorKind::Timeout | TransportErrorKind::Connect | TransportErrorKind::Body
        )
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        let kind = if e.is_timeout() {
            TransportErrorKind::Timeout
        } else if e.is_connect() {
            TransportErrorKind::Connect
        } else if e.is_body() || e.is_decode() {
            TransportErrorKind::Body
        } else {
            TransportErrorKind::Other
        };
        Self::new(kind, e.to_string())
    }
}

/// Result alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Raw, unparsed upstream response handed back to the caller.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Credential that served this response, set by the orchestrator.
    pub served_by: Option<String>,
}

impl RawResponse {
    pub fn new(status: u16, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
            served_by: None,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body decoded as UTF-8, lossily.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Body parsed as JSON, or `None` if it is not JSON.
    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.body).ok()
    }

    /// Integer header value, or `None` if absent or malformed.
    pub fn header_i64(&self, name: &str) -> Option<i64> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    }
}

/// A live, authenticated connection to the upstream service.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Box<dyn Transport>`).
pub trait Transport: Send + Sync {
    /// Issue one request. `headers` are per-request additions on top of the
    /// session headers (e.g. the transaction token).
    fn send<'a>(
        &'a self,
        method: &'a str,
        url: &'a str,
        params: &'a [(String, String)],
        headers: &'a HeaderMap,
    ) -> Pin<Box<dyn Future<Output = Result<RawResponse>> + Send + 'a>>;
}

/// Builds a transport from a credential's session material.
pub trait TransportFactory: Send + Sync {
    fn build(&self, credential: &Credential) -> Result<Box<dyn Transport>>;
}
