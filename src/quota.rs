//! Advisory per-period usage counters.
//!
//! A counter is registered once with a `max` and a [`QuotaPeriod`]. Usage is
//! stored under `name + period key` (for example `openai-chat-2024-05`), so a
//! new calendar period starts from zero without any reset job.
//!
//! The limiter never refuses to count: [`QuotaLimiter::reserve`] always adds
//! the amount and reports what is left, which may be negative. Callers that
//! want to gate work check `available` with a zero-amount reservation first.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::clock::{Clock, SystemClock};
use crate::telemetry::{PolicyEvent, QuotaEvent, Telemetry};

/// Name of the counter tracking LLM token usage.
pub const COMPLETION_COUNTER: &str = "openai-chat-";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QuotaError {
    #[error("unknown quota counter: {0}")]
    UnknownCounter(String),
    #[error("clock out of range: {0}ms")]
    ClockOutOfRange(u64),
    #[error("quota store failed: {0}")]
    Store(String),
}

/// Calendar period a counter resets on, evaluated in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaPeriod {
    Month,
    Day,
}

impl QuotaPeriod {
    /// `YYYY-MM` or `YYYY-MM-DD` for the period containing `now_millis`.
    pub fn key_at(&self, now_millis: u64) -> Result<String, QuotaError> {
        let now = i64::try_from(now_millis)
            .ok()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .ok_or(QuotaError::ClockOutOfRange(now_millis))?;
        let format = match self {
            QuotaPeriod::Month => "%Y-%m",
            QuotaPeriod::Day => "%Y-%m-%d",
        };
        Ok(now.format(format).to_string())
    }
}

/// Point-in-time view of a counter, as served by `/api/tokens`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaSnapshot {
    pub key: String,
    pub consumed: i64,
    pub max: i64,
    pub available: i64,
}

/// Storage for counter values.
///
/// `add` must be atomic: concurrent adds to one key never lose an update.
#[async_trait]
pub trait QuotaStore: Send + Sync + fmt::Debug {
    /// Add `amount` to `key` and return the new total. `amount = 0` reads.
    async fn add(&self, key: &str, amount: u64) -> Result<i64, QuotaError>;
}

/// Process-local store.
///
/// Counters for past periods are never removed; with monthly periods that is
/// one entry per counter per month.
#[derive(Debug, Default, Clone)]
pub struct InMemoryQuotaStore {
    data: Arc<Mutex<HashMap<String, i64>>>,
}

impl InMemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QuotaStore for InMemoryQuotaStore {
    async fn add(&self, key: &str, amount: u64) -> Result<i64, QuotaError> {
        let mut guard = self.data.lock().unwrap_or_else(|p| p.into_inner());
        if amount == 0 {
            return Ok(guard.get(key).copied().unwrap_or(0));
        }
        let amount = i64::try_from(amount).unwrap_or(i64::MAX);
        let total = guard.entry(key.to_string()).or_insert(0);
        *total = total.saturating_add(amount);
        Ok(*total)
    }
}

#[derive(Debug, Clone, Copy)]
struct Counter {
    max: i64,
    period: QuotaPeriod,
}

/// Named advisory counters over a [`QuotaStore`].
#[derive(Debug, Clone)]
pub struct QuotaLimiter {
    counters: HashMap<String, Counter>,
    store: Arc<dyn QuotaStore>,
    clock: Arc<dyn Clock>,
    telemetry: Telemetry,
}

impl Default for QuotaLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl QuotaLimiter {
    pub fn new() -> Self {
        Self {
            counters: HashMap::new(),
            store: Arc::new(InMemoryQuotaStore::new()),
            clock: Arc::new(SystemClock),
            telemetry: Telemetry::log(),
        }
    }

    /// Register (or replace) counter `name`.
    pub fn with_counter(mut self, name: impl Into<String>, max: i64, period: QuotaPeriod) -> Self {
        self.counters.insert(name.into(), Counter { max, period });
        self
    }

    pub fn with_store(mut self, store: Arc<dyn QuotaStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn has_counter(&self, name: &str) -> bool {
        self.counters.contains_key(name)
    }

    /// Add `amount` to counter `name` for the current period and return the
    /// resulting snapshot. Never refuses; `available` may go negative.
    pub async fn reserve(&self, name: &str, amount: u64) -> Result<QuotaSnapshot, QuotaError> {
        let counter = self
            .counters
            .get(name)
            .copied()
            .ok_or_else(|| QuotaError::UnknownCounter(name.to_string()))?;

        let key = format!("{}{}", name, counter.period.key_at(self.clock.now_millis())?);
        let consumed = self.store.add(&key, amount).await?;
        let snapshot = QuotaSnapshot {
            available: counter.max.saturating_sub(consumed),
            key,
            consumed,
            max: counter.max,
        };

        if amount > 0 {
            tracing::debug!(key = %snapshot.key, amount, consumed, max = counter.max, "quota reserved");
            self.telemetry
                .emit(PolicyEvent::Quota(QuotaEvent::Reserved {
                    key: snapshot.key.clone(),
                    amount,
                    consumed,
                    max: counter.max,
                }))
                .await;
        }
        if snapshot.available <= 0 {
            self.telemetry
                .emit(PolicyEvent::Quota(QuotaEvent::Exhausted {
                    key: snapshot.key.clone(),
                    consumed,
                    max: counter.max,
                }))
                .await;
        }
        Ok(snapshot)
    }

    /// Current usage of `name` without changing it.
    pub async fn snapshot(&self, name: &str) -> Result<QuotaSnapshot, QuotaError> {
        self.reserve(name, 0).await
    }
}
