//! Generator construction and per-credential cache
//!
//! Building a generator costs two HTTP fetches, so each credential keeps its
//! generator until the service signals the token is stale. The cache is an
//! explicit object owned by whoever runs the queue clients and shared
//! between them, not module-level state.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::constants::{TokenConstants, TokenSource};
use crate::error::{Error, Result};
use crate::generator::TxIdGenerator;
use crate::page;

/// Something that can build a fresh generator for a credential.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn GeneratorSource>`).
pub trait GeneratorSource: Send + Sync {
    fn create<'a>(
        &'a self,
        username: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<TxIdGenerator>> + Send + 'a>>;
}

/// Fetches the reference page and on-demand script over HTTP.
pub struct RemoteSource {
    client: reqwest::Client,
    source: TokenSource,
    constants: TokenConstants,
}

impl RemoteSource {
    pub fn new(source: TokenSource, constants: TokenConstants) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(source.user_agent.clone())
            .timeout(Duration::from_secs(source.timeout_secs))
            .build()
            .map_err(|e| Error::Http(format!("building token client: {e}")))?;
        Ok(Self {
            client,
            source,
            constants,
        })
    }

    async fn fetch_text(&self, url: &str) -> Result<String> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Http(format!("GET {url} returned {status}")));
        }
        Ok(response.text().await?)
    }
}

impl GeneratorSource for RemoteSource {
    fn create<'a>(
        &'a self,
        username: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<TxIdGenerator>> + Send + 'a>> {
        Box::pin(async move {
            let page_html = self.fetch_text(&self.source.page_url).await?;
            let script_url = page::ondemand_script_url(&page_html, &self.source.script_base)
                .ok_or_else(|| Error::Script("no on-demand script referenced by page".into()))?;
            let script = self.fetch_text(&script_url).await?;

            let generator =
                TxIdGenerator::from_sources(&page_html, &script, self.constants.clone())?;
            info!(username, script_url = %script_url, "built transaction token generator");
            Ok(generator)
        })
    }
}

/// Hands out clones of one prebuilt generator. Useful offline and in tests.
pub struct StaticSource {
    generator: TxIdGenerator,
}

impl StaticSource {
    pub fn new(generator: TxIdGenerator) -> Self {
        Self { generator }
    }
}

impl GeneratorSource for StaticSource {
    fn create<'a>(
        &'a self,
        _username: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<TxIdGenerator>> + Send + 'a>> {
        Box::pin(async move { Ok(self.generator.clone()) })
    }
}

/// Generators keyed by credential username.
pub struct GeneratorCache {
    source: Arc<dyn GeneratorSource>,
    entries: Mutex<HashMap<String, Arc<TxIdGenerator>>>,
}

impl GeneratorCache {
    pub fn new(source: Arc<dyn GeneratorSource>) -> Self {
        Self {
            source,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Cached generator for `username`, or a newly built one when there is
    /// none yet or `fresh` is set. A failed build leaves the cache as it was.
    pub async fn get(&self, username: &str, fresh: bool) -> Result<Arc<TxIdGenerator>> {
        if !fresh && let Some(cached) = self.entries.lock().await.get(username) {
            return Ok(cached.clone());
        }

        // Built outside the lock so one slow fetch does not stall other credentials
        let generator = Arc::new(self.source.create(username).await?);
        self.entries
            .lock()
            .await
            .insert(username.to_string(), generator.clone());
        debug!(username, fresh, "cached token generator");
        Ok(generator)
    }

    /// Drop the cached generator for `username`.
    pub async fn invalidate(&self, username: &str) {
        if self.entries.lock().await.remove(username).is_some() {
            debug!(username, "invalidated token generator");
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::tests::{fixture_page, fixture_script};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::net::TcpListener;

    /// Counts builds; each build gets a distinct animation key.
    struct CountingSource {
        builds: AtomicU32,
        fail: bool,
    }

    impl GeneratorSource for CountingSource {
        fn create<'a>(
            &'a self,
            _username: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<TxIdGenerator>> + Send + 'a>> {
            Box::pin(async move {
                if self.fail {
                    return Err(Error::Http("connection refused".into()));
                }
                let n = self.builds.fetch_add(1, Ordering::SeqCst);
                Ok(TxIdGenerator::new(
                    vec![1; 48],
                    format!("key{n}"),
                    TokenConstants::default(),
                ))
            })
        }
    }

    fn counting(fail: bool) -> Arc<CountingSource> {
        Arc::new(CountingSource {
            builds: AtomicU32::new(0),
            fail,
        })
    }

    #[tokio::test]
    async fn reuses_until_fresh_requested() {
        let source = counting(false);
        let cache = GeneratorCache::new(source.clone());

        let a = cache.get("alice", false).await.unwrap();
        let again = cache.get("alice", false).await.unwrap();
        assert_eq!(a.animation_key(), again.animation_key());
        assert_eq!(source.builds.load(Ordering::SeqCst), 1);

        let fresh = cache.get("alice", true).await.unwrap();
        assert_ne!(fresh.animation_key(), a.animation_key());
        assert_eq!(source.builds.load(Ordering::SeqCst), 2);

        // The fresh one replaced the cached one
        let cached = cache.get("alice", false).await.unwrap();
        assert_eq!(cached.animation_key(), fresh.animation_key());
    }

    #[tokio::test]
    async fn entries_are_per_credential() {
        let source = counting(false);
        let cache = GeneratorCache::new(source.clone());
        cache.get("alice", false).await.unwrap();
        cache.get("bob", false).await.unwrap();
        assert_eq!(cache.len().await, 2);

        cache.invalidate("alice").await;
        assert_eq!(cache.len().await, 1);
        cache.get("alice", false).await.unwrap();
        assert_eq!(source.builds.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failed_build_is_not_cached() {
        let cache = GeneratorCache::new(counting(true));
        let err = cache.get("alice", false).await.unwrap_err();
        assert!(matches!(err, Error::Http(_)));
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn remote_source_fetches_page_then_script() {
        let mut key = vec![0u8; 48];
        key[5] = 4;
        key[7] = 16;
        let page_html = fixture_page(&key);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let app = axum::Router::new()
                .route("/tesla", axum::routing::get(move || async move { page_html }))
                .route(
                    "/web/ondemand.s.6c4a2e7a.js",
                    axum::routing::get(|| async { fixture_script() }),
                );
            axum::serve(listener, app).await.unwrap();
        });

        let source = RemoteSource::new(
            TokenSource {
                page_url: format!("http://{addr}/tesla"),
                script_base: format!("http://{addr}/web"),
                ..TokenSource::default()
            },
            TokenConstants::default(),
        )
        .unwrap();

        let generator = source.create("alice").await.unwrap();
        assert_eq!(generator.verification_key(), key.as_slice());
        assert_eq!(generator.animation_key(), "ff010100100");
    }

    #[tokio::test]
    async fn remote_source_reports_missing_script() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let app = axum::Router::new().route(
                "/tesla",
                axum::routing::get(|| async { "<html><head></head></html>" }),
            );
            axum::serve(listener, app).await.unwrap();
        });

        let source = RemoteSource::new(
            TokenSource {
                page_url: format!("http://{addr}/tesla"),
                script_base: format!("http://{addr}/web"),
                ..TokenSource::default()
            },
            TokenConstants::default(),
        )
        .unwrap();

        let err = source.create("alice").await.unwrap_err();
        assert!(matches!(err, Error::Script(_)), "got {err:?}");
    }
}
