//! Round-robin pool of GitHub API credentials, rotated under per-token rate
//! limits. `acquire` blocks callers while every credential is exhausted;
//! `release` reconciles the optimistic decrement taken during `acquire`
//! against the authoritative quota reported by the most recent response.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Duration;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("no credentials configured")]
    NoCredentials,
    #[error("timed out acquiring a credential")]
    AcquireTimeout,
    #[error("quota source error: {0}")]
    QuotaSource(String),
}

/// A single API credential's cached rate-limit state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub key: String,
    pub remaining: i64,
    pub reset_at: DateTime<Utc>,
}

/// Queries a credential's live, authoritative quota. Backed by a real
/// GraphQL `rateLimit(dryRun:true)` request in production; a stub in tests.
#[async_trait]
pub trait QuotaSource: Send + Sync {
    async fn query(&self, key: &str) -> Result<(i64, DateTime<Utc>), CredentialError>;
}

struct Inner {
    credentials: VecDeque<Credential>,
}

enum ScanResult {
    Found(String),
    Exhausted(DateTime<Utc>),
}

/// An explicitly constructed, shareable dependency — one instance per
/// process, with its own internal mutex rather than a global singleton.
pub struct CredentialPool {
    inner: Mutex<Inner>,
    quota_source: Arc<dyn QuotaSource>,
    acquire_timeout: Duration,
    grace: Duration,
}

impl std::fmt::Debug for CredentialPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialPool").finish_non_exhaustive()
    }
}

impl CredentialPool {
    /// Builds a pool from already-known credential records.
    pub fn from_credentials(
        credentials: Vec<Credential>,
        quota_source: Arc<dyn QuotaSource>,
    ) -> Result<Self, CredentialError> {
        if credentials.is_empty() {
            return Err(CredentialError::NoCredentials);
        }
        Ok(Self {
            inner: Mutex::new(Inner {
                credentials: credentials.into(),
            }),
            quota_source,
            acquire_timeout: Duration::from_secs(5),
            grace: Duration::from_secs(10),
        })
    }

    /// Builds a pool from bare keys, querying live quota for each up front —
    /// the startup behavior: "loaded once at startup, quota queried live".
    pub async fn bootstrap(
        keys: Vec<String>,
        quota_source: Arc<dyn QuotaSource>,
    ) -> Result<Self, CredentialError> {
        if keys.is_empty() {
            return Err(CredentialError::NoCredentials);
        }
        let mut credentials = Vec::with_capacity(keys.len());
        for key in keys {
            let (remaining, reset_at) = quota_source.query(&key).await?;
            credentials.push(Credential {
                key,
                remaining,
                reset_at,
            });
        }
        Self::from_credentials(credentials, quota_source)
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Acquires a credential with remaining quota, rotating the pool
    /// round-robin. Suspends the caller while every credential reads
    /// exhausted, bounded by `acquire_timeout` (default 5s).
    pub async fn acquire(&self) -> Result<String, CredentialError> {
        tokio::time::timeout(self.acquire_timeout, self.acquire_inner())
            .await
            .map_err(|_| CredentialError::AcquireTimeout)?
    }

    async fn acquire_inner(&self) -> Result<String, CredentialError> {
        loop {
            match self.scan_once().await? {
                ScanResult::Found(key) => return Ok(key),
                ScanResult::Exhausted(min_reset_at) => {
                    let now = Utc::now();
                    let grace = chrono::Duration::from_std(self.grace).unwrap_or_default();
                    let sleep_for = (min_reset_at - now + grace)
                        .to_std()
                        .unwrap_or(Duration::from_secs(0));
                    tracing::debug!(?sleep_for, "credential pool exhausted, suspending caller");
                    tokio::time::sleep(sleep_for).await;
                    self.refresh_all().await?;
                }
            }
        }
    }

    async fn scan_once(&self) -> Result<ScanResult, CredentialError> {
        let mut guard = self.inner.lock().await;
        let len = guard.credentials.len();
        if len == 0 {
            return Err(CredentialError::NoCredentials);
        }

        let mut min_reset_at: Option<DateTime<Utc>> = None;
        for _ in 0..len {
            let mut cred = guard.credentials.pop_front().unwrap();
            let pre_remaining = cred.remaining;
            cred.remaining -= 1;
            min_reset_at = Some(match min_reset_at {
                Some(m) => m.min(cred.reset_at),
                None => cred.reset_at,
            });
            let key = cred.key.clone();
            guard.credentials.push_back(cred);

            if pre_remaining > 0 {
                return Ok(ScanResult::Found(key));
            }
        }
        Ok(ScanResult::Exhausted(min_reset_at.unwrap()))
    }

    /// Reconciles the optimistic decrement taken by `acquire` against the
    /// authoritative `(remaining, resetAt)` reported by the most recent
    /// response for `key`. Takes the minimum remaining and maximum reset
    /// horizon, so concurrent fetches racing ahead of each other can never
    /// push the cached estimate above the truth.
    pub async fn release(&self, key: &str, remaining: i64, reset_at: DateTime<Utc>) {
        let mut guard = self.inner.lock().await;
        if let Some(cred) = guard.credentials.iter_mut().find(|c| c.key == key) {
            cred.remaining = cred.remaining.min(remaining);
            cred.reset_at = cred.reset_at.max(reset_at);
        }
    }

    /// Authoritatively overwrites every credential's cached quota. Called
    /// only after the pool has suspended past a reset horizon, where a fresh
    /// live reading — not a monotone merge — is the correct source of truth.
    async fn refresh_all(&self) -> Result<(), CredentialError> {
        let keys: Vec<String> = {
            let guard = self.inner.lock().await;
            guard.credentials.iter().map(|c| c.key.clone()).collect()
        };
        for key in keys {
            let (remaining, reset_at) = self.quota_source.query(&key).await?;
            let mut guard = self.inner.lock().await;
            if let Some(cred) = guard.credentials.iter_mut().find(|c| c.key == key) {
                cred.remaining = remaining;
                cred.reset_at = reset_at;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    struct StubQuota {
        remaining: AtomicI64,
        reset_at: DateTime<Utc>,
    }

    #[async_trait]
    impl QuotaSource for StubQuota {
        async fn query(&self, _key: &str) -> Result<(i64, DateTime<Utc>), CredentialError> {
            Ok((self.remaining.load(Ordering::SeqCst), self.reset_at))
        }
    }

    fn credential(key: &str, remaining: i64) -> Credential {
        Credential {
            key: key.to_string(),
            remaining,
            reset_at: Utc::now() + chrono::Duration::hours(1),
        }
    }

    #[tokio::test]
    async fn scenario_s4_round_robin_skips_exhausted_key() {
        let quota = Arc::new(StubQuota {
            remaining: AtomicI64::new(100),
            reset_at: Utc::now() + chrono::Duration::hours(1),
        });
        let pool = CredentialPool::from_credentials(
            vec![
                credential("key1", 0),
                credential("key2", 5),
                credential("key3", 3),
            ],
            quota,
        )
        .unwrap();

        let mut acquired = Vec::new();
        for _ in 0..4 {
            acquired.push(pool.acquire().await.unwrap());
        }
        assert_eq!(acquired, vec!["key2", "key3", "key2", "key3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_s5_exhaustion_suspends_until_reset() {
        let reset_at = Utc::now() + chrono::Duration::seconds(2);
        let quota = Arc::new(StubQuota {
            remaining: AtomicI64::new(7),
            reset_at: reset_at + chrono::Duration::hours(1),
        });
        let pool = CredentialPool::from_credentials(
            vec![
                Credential {
                    key: "key1".into(),
                    remaining: 0,
                    reset_at,
                },
                Credential {
                    key: "key2".into(),
                    remaining: 0,
                    reset_at,
                },
            ],
            quota,
        )
        .unwrap()
        .with_acquire_timeout(Duration::from_secs(30));

        let start = tokio::time::Instant::now();
        let key = pool.acquire().await.unwrap();
        assert!(key == "key1" || key == "key2");
        assert!(tokio::time::Instant::now() - start >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn release_never_raises_remaining_or_lowers_reset() {
        let quota = Arc::new(StubQuota {
            remaining: AtomicI64::new(100),
            reset_at: Utc::now() + chrono::Duration::hours(1),
        });
        let base_reset = Utc::now() + chrono::Duration::minutes(30);
        let pool = CredentialPool::from_credentials(
            vec![Credential {
                key: "key1".into(),
                remaining: 10,
                reset_at: base_reset,
            }],
            quota,
        )
        .unwrap();

        // A racing response reports a higher remaining and an earlier reset:
        // the monotone merge must reject both.
        pool.release("key1", 50, base_reset - chrono::Duration::minutes(5))
            .await;
        let guard = pool.inner.lock().await;
        let cred = &guard.credentials[0];
        assert_eq!(cred.remaining, 10);
        assert_eq!(cred.reset_at, base_reset);
    }

    #[tokio::test]
    async fn empty_pool_fails_fast() {
        let quota = Arc::new(StubQuota {
            remaining: AtomicI64::new(1),
            reset_at: Utc::now(),
        });
        let err = CredentialPool::from_credentials(vec![], quota).unwrap_err();
        assert_eq!(err, CredentialError::NoCredentials);
    }
}
