//! Per-queue request orchestration
//!
//! A `QueueClient` holds at most one context (claimed credential + live
//! transport + token generator) at a time. Each attempt at a logical request
//! ends in one of four outcomes:
//!
//! - `Success`: hand the response back, keep the context
//! - `Rotate`: context already written back to the store, claim another
//! - `Abort`: context released, caller gets `None`
//! - `RetrySame`: transient failure, back off and retry on the same context
//!
//! Every rotation or abort writes exactly one store mutation (release,
//! lock-until or deactivate).

use std::sync::Arc;

use accounts::{Credential, CredentialStore};
use reqwest::header::{HeaderMap, HeaderValue};
use tracing::{debug, error, info, instrument, warn};
use transport::{RawResponse, Transport, TransportFactory};
use txid::constants::TRANSACTION_ID_HEADER;
use txid::{GeneratorCache, TxIdGenerator};

use crate::classify::{Verdict, classify};
use crate::error::{Error, Result};
use crate::metrics;
use crate::options::ClientOptions;

/// Recorded on accounts deactivated by a bare 403.
const FORBIDDEN_MESSAGE: &str = "Session expired or banned";

/// Claimed credential and everything built from it.
struct Context {
    credential: Credential,
    transport: Box<dyn Transport>,
    generator: Option<Arc<TxIdGenerator>>,
    /// The last token sent on this context was rejected with a 404.
    stale_token: bool,
    /// Responses received on this context since it was claimed.
    req_count: u64,
}

/// One logical request, as passed down to each send.
struct Call<'a> {
    method: &'a str,
    url: &'a str,
    path: &'a str,
    params: &'a [(String, String)],
}

/// How a context is written back to the store.
enum Close {
    Release,
    LockUntil(i64),
    Deactivate(Option<String>),
}

/// Result of sending on the held context.
enum Sent {
    Response(RawResponse),
    Transient(Error),
    Fatal(Error),
}

enum Attempt {
    Success(RawResponse),
    Rotate,
    Abort,
    RetrySame(Error),
}

impl Context {
    /// Send with a transaction token, regenerating it while the upstream
    /// answers 404. `stale` counts 404s across the whole logical request,
    /// so retries on the same or another account share the bound.
    async fn send(
        &mut self,
        generators: &GeneratorCache,
        call: &Call<'_>,
        token_attempts: u32,
        stale: &mut u32,
    ) -> Sent {
        let username = self.credential.username.as_str();
        loop {
            let cached = if self.stale_token {
                None
            } else {
                self.generator.clone()
            };
            let generator = match cached {
                Some(cached) => cached,
                None => match generators.get(username, self.stale_token).await {
                    Ok(generator) => {
                        self.generator = Some(generator.clone());
                        self.stale_token = false;
                        generator
                    }
                    Err(e) => return Sent::Transient(Error::Token(e.to_string())),
                },
            };

            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(&generator.calc(call.method, call.path)) {
                headers.insert(TRANSACTION_ID_HEADER, value);
            }

            let response = match self
                .transport
                .send(call.method, call.url, call.params, &headers)
                .await
            {
                Ok(response) => response,
                Err(e) if e.is_transient() => return Sent::Transient(Error::Transport(e.to_string())),
                Err(e) => return Sent::Fatal(Error::Transport(e.to_string())),
            };

            if response.status == 404 {
                *stale += 1;
                if *stale < token_attempts {
                    debug!(username, attempt = *stale, "404, retrying with a fresh transaction token");
                    self.stale_token = true;
                    continue;
                }
            }
            return Sent::Response(response);
        }
    }
}

/// Credential-rotating client for one queue.
///
/// Not shared between tasks: requests on one client run in program order,
/// which paginated streams depend on. Run one client per concurrent stream.
pub struct QueueClient {
    queue: String,
    store: Arc<CredentialStore>,
    factory: Arc<dyn TransportFactory>,
    generators: Arc<GeneratorCache>,
    options: ClientOptions,
    ctx: Option<Context>,
}

impl QueueClient {
    pub fn new(
        queue: impl Into<String>,
        store: Arc<CredentialStore>,
        factory: Arc<dyn TransportFactory>,
        generators: Arc<GeneratorCache>,
        options: ClientOptions,
    ) -> Self {
        Self {
            queue: queue.into(),
            store,
            factory,
            generators,
            options,
            ctx: None,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Username of the credential currently held, if any.
    pub fn current_account(&self) -> Option<&str> {
        self.ctx.as_ref().map(|ctx| ctx.credential.username.as_str())
    }

    pub async fn get(
        &mut self,
        url: &str,
        params: &[(String, String)],
    ) -> Result<Option<RawResponse>> {
        self.request("GET", url, params).await
    }

    /// Run one logical request.
    ///
    /// `Ok(None)` means the request was aborted for a reason unrelated to
    /// the credential (upstream dependency failure); try again later.
    /// `Err(NoAccount)` only happens when waiting for a credential is
    /// disabled.
    pub async fn request(
        &mut self,
        method: &str,
        url: &str,
        params: &[(String, String)],
    ) -> Result<Option<RawResponse>> {
        let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
        self.run(method, url, params, &request_id).await
    }

    /// Release the held credential, if any.
    pub async fn close(&mut self) {
        self.finish(Close::Release).await;
    }

    #[instrument(skip(self, params), fields(queue = %self.queue))]
    async fn run(
        &mut self,
        method: &str,
        url: &str,
        params: &[(String, String)],
        request_id: &str,
    ) -> Result<Option<RawResponse>> {
        let path = url::Url::parse(url)
            .map_err(|e| Error::Transport(format!("invalid url {url}: {e}")))?
            .path()
            .to_string();
        let call = Call {
            method,
            url,
            path: &path,
            params,
        };

        let mut retries = 0u32;
        let mut stale = 0u32;
        loop {
            match self.attempt(&call, &mut stale).await? {
                Attempt::Success(rep) => return Ok(Some(rep)),
                Attempt::Abort => return Ok(None),
                Attempt::Rotate => retries = 0,
                Attempt::RetrySame(err) => {
                    retries += 1;
                    if retries > self.options.retry.max_retries {
                        error!(error = %err, retries = retries - 1, "giving up after transient failures");
                        self.close().await;
                        return Err(err);
                    }
                    let delay = self.options.retry.delay(retries);
                    warn!(
                        error = %err,
                        retry = retries,
                        delay_ms = delay.as_millis() as u64,
                        "transient failure, retrying on same account"
                    );
                    metrics::record_transport_retry(&self.queue);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Claim a credential (waiting or failing fast per options) and build
    /// its transport.
    async fn open_context(&self) -> Result<Context> {
        let credential = if self.options.wait_for_account {
            self.store
                .wait_for_any(&self.queue, self.options.poll_interval())
                .await?
        } else {
            self.store
                .claim(&self.queue)
                .await?
                .ok_or_else(|| Error::NoAccount(self.queue.clone()))?
        };

        let transport = match self.factory.build(&credential) {
            Ok(transport) => transport,
            Err(e) => {
                if let Err(release_err) = self.store.release(&credential.username, &self.queue, 0).await {
                    warn!(username = %credential.username, error = %release_err, "failed to release account");
                }
                return Err(Error::Transport(format!(
                    "building transport for {}: {e}",
                    credential.username
                )));
            }
        };

        info!(username = %credential.username, "using account");
        Ok(Context {
            credential,
            transport,
            generator: None,
            stale_token: false,
            req_count: 0,
        })
    }

    /// Send on the held context (claiming one first if needed), classify,
    /// and settle the context.
    ///
    /// The context stays in `self` while the request is in flight, so a
    /// cancelled request still releases it on close or drop.
    async fn attempt(&mut self, call: &Call<'_>, stale: &mut u32) -> Result<Attempt> {
        let ctx = match self.ctx.take() {
            Some(ctx) => ctx,
            None => self.open_context().await?,
        };
        let ctx = self.ctx.insert(ctx);
        let token_attempts = self.options.token_attempts.max(1);

        let mut rep = match ctx.send(&self.generators, call, token_attempts, stale).await {
            Sent::Response(rep) => rep,
            Sent::Transient(err) => return Ok(Attempt::RetrySame(err)),
            Sent::Fatal(err) => {
                self.close().await;
                return Err(err);
            }
        };

        ctx.req_count += 1;
        let username = ctx.credential.username.clone();
        rep.served_by = Some(username.clone());
        let status = rep.status;
        let verdict = classify(&rep);
        metrics::record_response(&self.queue, verdict.label());

        let outcome = match (verdict, self.options.unhandled_status_lock_secs) {
            (Verdict::RateLimited { reset }, _) => {
                info!(username, status, reset, "rate limited, rotating account");
                self.rotate(Close::LockUntil(reset), "rate_limited").await;
                Attempt::Rotate
            }
            (Verdict::Banned { message }, _) => {
                warn!(username, status, error = %message, "rate limit with quota left, account banned");
                self.rotate(Close::Deactivate(Some(message)), "banned").await;
                Attempt::Rotate
            }
            (Verdict::AuthFailed { message }, _) => {
                warn!(username, status, error = %message, "session rejected, deactivating account");
                self.rotate(Close::Deactivate(Some(message)), "auth_failed").await;
                Attempt::Rotate
            }
            (Verdict::Forbidden, _) => {
                warn!(username, status, "bare 403, deactivating account");
                let message = FORBIDDEN_MESSAGE.to_string();
                self.rotate(Close::Deactivate(Some(message)), "forbidden").await;
                Attempt::Rotate
            }
            (Verdict::DependencyAbort { message }, _) => {
                warn!(username, status, error = %message, "upstream dependency failure, aborting request");
                self.finish(Close::Release).await;
                Attempt::Abort
            }
            (Verdict::UnhandledStatus { .. }, Some(park_secs)) => {
                let until = self.store.now() + park_secs as i64;
                warn!(username, status, until, "unexpected status, parking account");
                self.rotate(Close::LockUntil(until), "unhandled_status").await;
                Attempt::Rotate
            }
            (Verdict::OtherError { message }, _) => {
                warn!(username, status, error = %message, "error payload, returning response anyway");
                Attempt::Success(rep)
            }
            (
                Verdict::UnhandledStatus { .. }
                | Verdict::DependencyWithData
                | Verdict::Missing
                | Verdict::Ok,
                _,
            ) => {
                debug!(username, status, "response accepted");
                Attempt::Success(rep)
            }
        };
        Ok(outcome)
    }

    async fn rotate(&mut self, how: Close, reason: &str) {
        metrics::record_rotation(&self.queue, reason);
        self.finish(how).await;
    }

    /// Write the held context's outcome back to the store. Store failures
    /// are logged; the claim then simply expires with its provisional window.
    async fn finish(&mut self, how: Close) {
        let Some(ctx) = self.ctx.take() else {
            return;
        };
        let username = ctx.credential.username.as_str();
        let result = match how {
            Close::Release => {
                self.store
                    .release(username, &self.queue, ctx.req_count)
                    .await
            }
            Close::LockUntil(at) => {
                self.store
                    .lock_until(username, &self.queue, at, ctx.req_count)
                    .await
            }
            Close::Deactivate(message) => {
                self.generators.invalidate(username).await;
                self.store.deactivate(username, message.as_deref()).await
            }
        };
        if let Err(e) = result {
            warn!(username, queue = %self.queue, error = %e, "failed to write back account state");
        }
    }
}

impl Drop for QueueClient {
    fn drop(&mut self) {
        let Some(ctx) = self.ctx.take() else {
            return;
        };
        let username = ctx.credential.username.clone();
        let req_count = ctx.req_count;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = self.store.clone();
                let queue = self.queue.clone();
                handle.spawn(async move {
                    if let Err(e) = store.release(&username, &queue, req_count).await {
                        warn!(username, queue, error = %e, "failed to release account on drop");
                    }
                });
            }
            Err(_) => {
                warn!(username, queue = %self.queue, "dropped outside a runtime, account stays locked until its claim window ends");
            }
        }
    }
}
