//! Drains a [`broker::Broker`] of crawl targets and fetches each against the
//! GitHub GraphQL API, bounded by a concurrency cap and a shared credential
//! pool. Transient failures (timeouts, network errors) go back to the
//! broker; permanent ones (GraphQL `errors`, missing `data.repository`) go to
//! the error sink and are never retried.

use async_trait::async_trait;
use broker::{Broker, CrawlTarget};
use chrono::{DateTime, Utc};
use credentials::{CredentialError, CredentialPool, QuotaSource};
use docstore::{DocumentSink, ErrorSink};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Network(String),
    #[error("response body was not valid JSON: {0}")]
    InvalidJson(String),
}

/// Parsed GraphQL response envelope. Kept as a thin wrapper over the raw
/// value rather than a typed struct, since the crawler only ever looks at
/// three shapes of it: top-level errors, `data.repository`, `data.rateLimit`.
pub struct GraphQlResponse(pub Value);

pub struct RateLimit {
    pub remaining: i64,
    pub reset_at: DateTime<Utc>,
}

impl GraphQlResponse {
    /// The fetched repository document, or `None` if the response carried
    /// top-level `errors` or no `data.repository`.
    pub fn repository(&self) -> Option<Value> {
        if self.0.get("errors").is_some() {
            return None;
        }
        self.0
            .get("data")?
            .get("repository")
            .cloned()
            .filter(|v| !v.is_null())
    }

    pub fn rate_limit(&self) -> Option<RateLimit> {
        let rl = self.0.get("data")?.get("rateLimit")?;
        let remaining = rl.get("remaining")?.as_i64()?;
        let reset_at = rl.get("resetAt")?.as_str()?.parse().ok()?;
        Some(RateLimit { remaining, reset_at })
    }
}

/// A single GraphQL round trip against the GitHub API. Implemented by
/// [`ReqwestGithubClient`] in production and by stubs in tests, so the
/// crawl loop's retry and timeout behavior can be exercised without a
/// network.
#[async_trait]
pub trait GithubClient: Send + Sync {
    async fn fetch(&self, owner: &str, name: &str, token: &str) -> Result<GraphQlResponse, FetchError>;
}

const REPOSITORY_QUERY: &str = r#"
query($owner: String!, $name: String!) {
  repository(owner: $owner, name: $name) {
    id
    nameWithOwner
    description
    stargazerCount
    primaryLanguage { name }
  }
  rateLimit { remaining resetAt }
}
"#;

const RATE_LIMIT_QUERY: &str = "query { rateLimit(dryRun: true) { remaining resetAt } }";

pub struct ReqwestGithubClient {
    http: reqwest::Client,
    endpoint: Url,
}

impl ReqwestGithubClient {
    pub fn new(endpoint: Url) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl GithubClient for ReqwestGithubClient {
    async fn fetch(&self, owner: &str, name: &str, token: &str) -> Result<GraphQlResponse, FetchError> {
        let body = serde_json::json!({
            "query": REPOSITORY_QUERY,
            "variables": { "owner": owner, "name": name },
        });
        let resp = self
            .http
            .post(self.endpoint.clone())
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;
        let value = resp
            .json::<Value>()
            .await
            .map_err(|e| FetchError::InvalidJson(e.to_string()))?;
        Ok(GraphQlResponse(value))
    }
}

/// Queries live rate-limit quota via a `dryRun` GraphQL request, the
/// production [`QuotaSource`] the credential pool bootstraps and refreshes
/// from.
pub struct GithubQuotaSource {
    http: reqwest::Client,
    endpoint: Url,
}

impl GithubQuotaSource {
    pub fn new(endpoint: Url) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl QuotaSource for GithubQuotaSource {
    async fn query(&self, key: &str) -> Result<(i64, DateTime<Utc>), CredentialError> {
        let body = serde_json::json!({ "query": RATE_LIMIT_QUERY });
        let resp = self
            .http
            .post(self.endpoint.clone())
            .bearer_auth(key)
            .json(&body)
            .send()
            .await
            .map_err(|e| CredentialError::QuotaSource(e.to_string()))?;
        let value: Value = resp
            .json()
            .await
            .map_err(|e| CredentialError::QuotaSource(e.to_string()))?;
        let rl = value
            .get("data")
            .and_then(|d| d.get("rateLimit"))
            .ok_or_else(|| CredentialError::QuotaSource("response missing rateLimit".into()))?;
        let remaining = rl
            .get("remaining")
            .and_then(Value::as_i64)
            .ok_or_else(|| CredentialError::QuotaSource("rateLimit missing remaining".into()))?;
        let reset_at = rl
            .get("resetAt")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| CredentialError::QuotaSource("rateLimit missing resetAt".into()))?;
        Ok((remaining, reset_at))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CrawlerConfig {
    pub max_concurrent: usize,
    pub batch_size: usize,
    pub sleep_interval: Duration,
    pub http_timeout: Duration,
    pub put_timeout: Duration,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            batch_size: 100,
            sleep_interval: Duration::from_secs(10),
            http_timeout: Duration::from_secs(10),
            put_timeout: Duration::from_secs(10),
        }
    }
}

/// Coordinates one process's worth of fetching: a broker to drain, a
/// credential pool to rotate, and the two sinks fetched documents end up in.
#[derive(Clone)]
pub struct Crawler {
    broker: Arc<Broker>,
    credentials: Arc<CredentialPool>,
    client: Arc<dyn GithubClient>,
    sink: Arc<dyn DocumentSink>,
    errors: Arc<dyn ErrorSink>,
    config: CrawlerConfig,
}

impl Crawler {
    pub fn new(
        broker: Arc<Broker>,
        credentials: Arc<CredentialPool>,
        client: Arc<dyn GithubClient>,
        sink: Arc<dyn DocumentSink>,
        errors: Arc<dyn ErrorSink>,
        config: CrawlerConfig,
    ) -> Self {
        Self {
            broker,
            credentials,
            client,
            sink,
            errors,
            config,
        }
    }

    /// Runs forever, draining the broker and sleeping `sleep_interval`
    /// whenever it comes up empty.
    pub async fn run(self: Arc<Self>) {
        loop {
            match self.drain_once().await {
                Ok(0) => tokio::time::sleep(self.config.sleep_interval).await,
                Ok(_) => {}
                Err(error) => {
                    tracing::error!(%error, "broker error draining crawl queue");
                    tokio::time::sleep(self.config.sleep_interval).await;
                }
            }
        }
    }

    /// Drains up to `batch_size` targets, fetching at most `max_concurrent`
    /// at a time, and waits for all of them to finish. Returns the number of
    /// targets drained. Exposed separately from [`Crawler::run`] so a single
    /// iteration can be driven from a test.
    pub async fn drain_once(self: &Arc<Self>) -> Result<usize, broker::BrokerError> {
        let targets = self.broker.dequeue_bulk(self.config.batch_size).await?;
        if targets.is_empty() {
            return Ok(0);
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent));
        let mut tasks = tokio::task::JoinSet::new();
        let drained = targets.len();
        for target in targets {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore is never closed");
            let this = Arc::clone(self);
            tasks.spawn(async move {
                this.fetch_one(target).await;
                drop(permit);
            });
        }
        while tasks.join_next().await.is_some() {}
        Ok(drained)
    }

    async fn fetch_one(&self, target: CrawlTarget) {
        let token = match self.credentials.acquire().await {
            Ok(token) => token,
            Err(CredentialError::AcquireTimeout) => {
                // Abandoning here rather than requeuing avoids a livelock: a
                // pool that is globally exhausted would otherwise just see
                // the same target come right back around. The target was
                // already dequeued, so it still needs a durable record.
                tracing::warn!(owner = %target.owner, name = %target.name, "credential acquire timed out, abandoning attempt");
                self.record_abandoned(&target, "credential acquire timed out").await;
                return;
            }
            Err(error) => {
                tracing::error!(%error, "credential pool unavailable");
                self.record_abandoned(&target, &error.to_string()).await;
                return;
            }
        };

        let fetched = tokio::time::timeout(
            self.config.http_timeout,
            self.client.fetch(&target.owner, &target.name, &token),
        )
        .await;

        let response = match fetched {
            Ok(Ok(response)) => response,
            Ok(Err(error)) => {
                tracing::warn!(owner = %target.owner, name = %target.name, %error, "fetch failed, requeuing");
                self.requeue(&target).await;
                return;
            }
            Err(_) => {
                tracing::warn!(owner = %target.owner, name = %target.name, "fetch timed out, requeuing");
                self.requeue(&target).await;
                return;
            }
        };

        if let Some(rate_limit) = response.rate_limit() {
            self.credentials
                .release(&token, rate_limit.remaining, rate_limit.reset_at)
                .await;
        }

        match response.repository() {
            Some(doc) => {
                let put = tokio::time::timeout(self.config.put_timeout, self.sink.put(doc)).await;
                if !matches!(put, Ok(Ok(()))) {
                    tracing::warn!(owner = %target.owner, name = %target.name, "document store put failed, requeuing");
                    self.requeue(&target).await;
                }
            }
            None => {
                let entry = serde_json::json!({
                    "owner": target.owner,
                    "name": target.name,
                    "response": response.0,
                });
                if let Err(error) = self.errors.record(entry).await {
                    tracing::error!(%error, "failed to record crawl error");
                }
            }
        }
    }

    async fn requeue(&self, target: &CrawlTarget) {
        if let Err(error) = self.broker.enqueue(target).await {
            tracing::error!(%error, "failed to requeue crawl target");
        }
    }

    /// Records a target abandoned without a requeue (credential exhaustion
    /// or pool failure) so it isn't lost with no durable trace — it was
    /// already popped off the broker, and this path doesn't put it back.
    async fn record_abandoned(&self, target: &CrawlTarget, reason: &str) {
        let entry = serde_json::json!({
            "owner": target.owner,
            "name": target.name,
            "reason": reason,
        });
        if let Err(error) = self.errors.record(entry).await {
            tracing::error!(%error, "failed to record abandoned crawl target");
        }
    }
}
