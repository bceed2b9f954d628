//! Composition of cache, retry, timeout, and quota around upstream calls.
//!
//! Every upstream call goes through the same pipeline:
//!
//! ```text
//! cache.getset(key) -> [quota check] -> retry(timeout(call)) -> [quota charge] -> store
//! ```
//!
//! Results are kept in the shared cache as JSON values, so one cache serves
//! every backend. Failures reach all callers waiting on the key and are never
//! cached.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::cache::SingleFlightCache;
use crate::error::{GatewayError, ResilienceError};
use crate::quota::{QuotaLimiter, QuotaSnapshot};
use crate::retry::RetryPolicy;
use crate::timeout::TimeoutPolicy;

/// Cache shared by every backend.
pub type ResponseCache = SingleFlightCache<Value, GatewayError>;

/// Result of a metered call together with the usage it reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metered<T> {
    pub value: T,
    pub cost: u64,
}

#[derive(Debug, Clone)]
pub struct RequestOrchestrator {
    cache: Arc<ResponseCache>,
    quota: Arc<QuotaLimiter>,
    retry: RetryPolicy<GatewayError>,
    timeout: TimeoutPolicy,
}

impl RequestOrchestrator {
    pub fn new(
        cache: Arc<ResponseCache>,
        quota: Arc<QuotaLimiter>,
        retry: RetryPolicy<GatewayError>,
        timeout: TimeoutPolicy,
    ) -> Self {
        Self { cache, quota, retry, timeout }
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn quota(&self) -> &Arc<QuotaLimiter> {
        &self.quota
    }

    /// Cached, retried, time-limited call with no usage accounting.
    pub async fn fetch<T, F, Fut>(&self, key: &str, ttl: Duration, call: F) -> Result<T, GatewayError>
    where
        T: Serialize + DeserializeOwned + Send,
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, GatewayError>> + Send,
    {
        let value = self
            .cache
            .getset(key, ttl, || async {
                let fresh = self.guarded(&call).await?;
                Ok(serde_json::to_value(fresh)?)
            })
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Like [`fetch`](Self::fetch), charged against quota counter `counter`.
    ///
    /// The upstream is not called when the counter has nothing left. A
    /// successful call is charged with the cost it reports, even if that
    /// takes the counter below zero. Cache hits are free.
    pub async fn metered<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        counter: &str,
        call: F,
    ) -> Result<T, GatewayError>
    where
        T: Serialize + DeserializeOwned + Send,
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<Metered<T>, GatewayError>> + Send,
    {
        let value = self
            .cache
            .getset(key, ttl, || async {
                let before = self.quota.reserve(counter, 0).await?;
                if before.available <= 0 {
                    tracing::warn!(key = %before.key, consumed = before.consumed, max = before.max, "quota exhausted");
                    return Err(GatewayError::QuotaExhausted {
                        key: before.key,
                        consumed: before.consumed,
                        max: before.max,
                    });
                }

                let Metered { value, cost } = self.guarded(&call).await?;
                let after = self.quota.reserve(counter, cost).await?;
                tracing::info!(key = %after.key, cost, available = after.available, "metered call charged");
                Ok(serde_json::to_value(value)?)
            })
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Usage of `counter` in the current period.
    pub async fn usage(&self, counter: &str) -> Result<QuotaSnapshot, GatewayError> {
        Ok(self.quota.snapshot(counter).await?)
    }

    async fn guarded<T, F, Fut>(&self, call: &F) -> Result<T, GatewayError>
    where
        T: Send,
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, GatewayError>> + Send,
    {
        let timeout = &self.timeout;
        self.retry
            .execute(move || {
                let attempt = call();
                timeout.execute(move || async move { attempt.await.map_err(ResilienceError::Inner) })
            })
            .await
            .map_err(GatewayError::from)
    }
}
