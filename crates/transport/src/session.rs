//! reqwest transport built from a credential's session material.
//!
//! One client per claimed credential: its stored headers, its cookies folded
//! into a single `cookie` header, a CSRF header mirrored from the `ct0`
//! cookie, and its proxy if it has one. Invalid header names or values in
//! stored session material are skipped with a warning rather than failing
//! the whole session.

use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;

use accounts::Credential;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::{debug, warn};

use crate::{RawResponse, Result, Transport, TransportError, TransportErrorKind, TransportFactory};

/// Browser user agent used when a credential does not carry its own.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Headers every session sends regardless of stored material.
const SESSION_HEADERS: &[(&str, &str)] = &[
    ("content-type", "application/json"),
    ("x-twitter-active-user", "yes"),
    ("x-twitter-client-language", "en"),
];

/// Cookie whose value must be echoed in the CSRF header.
const CSRF_COOKIE: &str = "ct0";
const CSRF_HEADER: &str = "x-csrf-token";

/// Builds [`SessionTransport`]s with a shared timeout and header defaults.
#[derive(Debug, Clone)]
pub struct SessionTransportFactory {
    timeout: Duration,
    user_agent: String,
    extra_headers: Vec<(String, String)>,
}

impl SessionTransportFactory {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            extra_headers: Vec::new(),
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Add a header sent by every session (after the built-in defaults,
    /// before the credential's own headers).
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.push((name.into(), value.into()));
        self
    }

    /// Header map a session for `credential` starts from.
    pub fn session_headers(&self, credential: &Credential) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in SESSION_HEADERS {
            insert_header(&mut headers, name, value);
        }
        for (name, value) in &self.extra_headers {
            insert_header(&mut headers, name, value);
        }
        for (name, value) in &credential.headers {
            insert_header(&mut headers, name, value);
        }

        let user_agent = credential
            .user_agent
            .as_deref()
            .unwrap_or(self.user_agent.as_str());
        insert_header(&mut headers, "user-agent", user_agent);

        if let Some(cookie) = credential.cookie_header() {
            insert_header(&mut headers, "cookie", &cookie);
        }
        if !headers.contains_key(CSRF_HEADER)
            && let Some(ct0) = credential.cookies.get(CSRF_COOKIE)
        {
            insert_header(&mut headers, CSRF_HEADER, ct0);
        }
        headers
    }
}

impl TransportFactory for SessionTransportFactory {
    fn build(&self, credential: &Credential) -> Result<Box<dyn Transport>> {
        let mut builder = reqwest::Client::builder()
            .default_headers(self.session_headers(credential))
            .timeout(self.timeout);

        if let Some(proxy) = credential.proxy.as_deref().filter(|p| !p.is_empty()) {
            let proxy = reqwest::Proxy::all(proxy).map_err(|e| {
                TransportError::new(
                    TransportErrorKind::Other,
                    format!("invalid proxy for {}: {e}", credential.username),
                )
            })?;
            builder = builder.proxy(proxy);
        }

        let client = builder.build().map_err(|e| {
            TransportError::new(
                TransportErrorKind::Other,
                format!("building client for {}: {e}", credential.username),
            )
        })?;
        debug!(username = %credential.username, "built session transport");
        Ok(Box::new(SessionTransport { client }))
    }
}

/// Live reqwest client bound to one credential.
pub struct SessionTransport {
    client: reqwest::Client,
}

impl Transport for SessionTransport {
    fn send<'a>(
        &'a self,
        method: &'a str,
        url: &'a str,
        params: &'a [(String, String)],
        headers: &'a HeaderMap,
    ) -> Pin<Box<dyn Future<Output = Result<RawResponse>> + Send + 'a>> {
        Box::pin(async move {
            let method = reqwest::Method::from_str(&method.to_uppercase()).map_err(|e| {
                TransportError::new(TransportErrorKind::Other, format!("invalid method: {e}"))
            })?;

            let mut request = self.client.request(method, url).headers(headers.clone());
            if !params.is_empty() {
                request = request.query(params);
            }

            let response = request.send().await?;
            let status = response.status().as_u16();
            let resp_headers = response.headers().clone();
            let body = response.bytes().await?;

            Ok(RawResponse::new(status, resp_headers, body))
        })
    }
}

/// Insert a header, skipping (with a warning) names or values that are not
/// valid HTTP.
fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) {
    let header_name = match HeaderName::from_str(name) {
        Ok(n) => n,
        Err(e) => {
            warn!(header = %name, error = %e, "skipping invalid header name");
            return;
        }
    };
    let header_value = match HeaderValue::from_str(value) {
        Ok(v) => v,
        Err(e) => {
            warn!(header = %name, error = %e, "skipping invalid header value");
            return;
        }
    };
    headers.insert(header_name, header_value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::net::TcpListener;

    fn credential() -> Credential {
        let mut c = Credential::new("alice");
        c.cookies.insert("ct0".into(), "csrf123".into());
        c.cookies.insert("auth_token".into(), "tok456".into());
        c.headers.insert("authorization".into(), "Bearer AAAA".into());
        c
    }

    /// Start a mock upstream that echoes method, query and headers as JSON.
    async fn start_echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let app = axum::Router::new().fallback(
                |request: axum::http::Request<axum::body::Body>| async move {
                    let mut headers = serde_json::Map::new();
                    for (name, value) in request.headers() {
                        headers.insert(
                            name.to_string(),
                            serde_json::Value::String(value.to_str().unwrap_or("").to_string()),
                        );
                    }
                    let body = serde_json::json!({
                        "method": request.method().to_string(),
                        "path": request.uri().path(),
                        "query": request.uri().query().unwrap_or(""),
                        "headers": headers,
                    });
                    (
                        StatusCode::OK,
                        [("x-rate-limit-remaining", "42")],
                        axum::Json(body),
                    )
                },
            );
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn session_headers_carry_cookies_and_csrf() {
        let factory = SessionTransportFactory::new(Duration::from_secs(5));
        let headers = factory.session_headers(&credential());

        assert_eq!(headers.get("authorization").unwrap(), "Bearer AAAA");
        assert_eq!(headers.get("x-csrf-token").unwrap(), "csrf123");
        assert_eq!(
            headers.get("cookie").unwrap(),
            "auth_token=tok456; ct0=csrf123"
        );
        assert_eq!(headers.get("x-twitter-active-user").unwrap(), "yes");
        assert_eq!(headers.get("user-agent").unwrap(), DEFAULT_USER_AGENT);
    }

    #[test]
    fn stored_csrf_header_is_not_overwritten() {
        let mut c = credential();
        c.headers.insert("x-csrf-token".into(), "explicit".into());
        let headers = SessionTransportFactory::new(Duration::from_secs(5)).session_headers(&c);
        assert_eq!(headers.get("x-csrf-token").unwrap(), "explicit");
    }

    #[test]
    fn credential_user_agent_wins() {
        let mut c = credential();
        c.user_agent = Some("custom-agent/1.0".into());
        let factory = SessionTransportFactory::new(Duration::from_secs(5)).with_user_agent("other");
        let headers = factory.session_headers(&c);
        assert_eq!(headers.get("user-agent").unwrap(), "custom-agent/1.0");
    }

    #[test]
    fn invalid_session_headers_are_skipped() {
        let mut c = credential();
        c.headers.insert("bad header name".into(), "v".into());
        c.headers.insert("x-bad-value".into(), "line\nbreak".into());
        let factory =
            SessionTransportFactory::new(Duration::from_secs(5)).with_header("x-extra", "1");
        let headers = factory.session_headers(&c);

        assert!(headers.get("bad header name").is_none());
        assert!(headers.get("x-bad-value").is_none());
        assert_eq!(headers.get("x-extra").unwrap(), "1");
    }

    #[test]
    fn invalid_proxy_is_rejected() {
        let mut c = credential();
        c.proxy = Some("not a url at all".into());
        let err = SessionTransportFactory::new(Duration::from_secs(5))
            .build(&c)
            .err()
            .expect("invalid proxy must fail");
        assert_eq!(err.kind, TransportErrorKind::Other);
        assert!(err.message.contains("alice"));
    }

    #[tokio::test]
    async fn send_forwards_params_and_headers() {
        let url = start_echo_server().await;
        let transport = SessionTransportFactory::new(Duration::from_secs(5))
            .build(&credential())
            .unwrap();

        let mut extra = HeaderMap::new();
        extra.insert("x-client-transaction-id", HeaderValue::from_static("tx-1"));
        let params = vec![("variables".to_string(), "{\"q\":1}".to_string())];

        let rep = transport
            .send("get", &format!("{url}/graphql/SearchTimeline"), &params, &extra)
            .await
            .unwrap();

        assert_eq!(rep.status, 200);
        assert_eq!(rep.header_i64("x-rate-limit-remaining"), Some(42));
        let echoed = rep.json().unwrap();
        assert_eq!(echoed["method"], "GET");
        assert_eq!(echoed["path"], "/graphql/SearchTimeline");
        assert!(echoed["query"].as_str().unwrap().starts_with("variables="));
        assert_eq!(echoed["headers"]["x-client-transaction-id"], "tx-1");
        assert_eq!(echoed["headers"]["x-csrf-token"], "csrf123");
    }

    #[tokio::test]
    async fn silent_upstream_is_a_timeout() {
        let accepted = Arc::new(AtomicU64::new(0));
        let counter = accepted.clone();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (socket, _) = listener.accept().await.unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    drop(socket);
                });
            }
        });

        let transport = SessionTransportFactory::new(Duration::from_millis(50))
            .build(&credential())
            .unwrap();
        let err = transport
            .send("GET", &format!("http://{addr}/slow"), &[], &HeaderMap::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind, TransportErrorKind::Timeout);
        assert!(err.is_transient());
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refused_connection_is_transient() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = SessionTransportFactory::new(Duration::from_secs(2))
            .build(&credential())
            .unwrap();
        let err = transport
            .send("GET", &format!("http://{addr}/"), &[], &HeaderMap::new())
            .await
            .unwrap_err();
        assert!(err.is_transient(), "got {err:?}");
    }
}
