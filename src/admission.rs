//! Per-client admission control.
//!
//! Two limiters run in front of every gated route, both counting requests per
//! client identity in fixed, wall-clock aligned windows:
//!
//! - [`SlowDown`] (soft stage): the first `delay_after` requests in a window
//!   pass immediately; each request beyond that waits one more `delay` than the
//!   one before it. It never refuses.
//! - [`FixedWindow`] (hard stage): at most `limit` requests per window; the
//!   rest are denied until the window rolls over.
//!
//! [`AdmissionGate`] applies the soft stage and then the hard stage. Limiters
//! keep their counts in a [`WindowStore`]; the in-memory store is enough for a
//! single process.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::clock::{Clock, SystemClock};
use crate::error::{GatewayError, ResilienceError};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{AdmissionEvent, PolicyEvent, Telemetry};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The decision returned by a limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The request may proceed, after waiting `delay`.
    Allowed {
        /// Requests left in the current window.
        remaining: u32,
        delay: Duration,
    },
    /// The request is denied.
    Denied {
        /// Time until the current window ends.
        wait: Duration,
        reason: &'static str,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }
}

/// Core interface for admission logic.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Count one request from `identity` and decide on it.
    async fn acquire(&self, identity: &str) -> Result<Decision, BoxError>;
}

/// Storage for per-key window counters.
#[async_trait]
pub trait WindowStore: Send + Sync + fmt::Debug {
    /// Count a hit for `key` in the window ending at `window_end` and return
    /// the hit count within that window. A stored counter for any other window
    /// is discarded first.
    async fn hit(&self, key: &str, window_end: u64) -> Result<u32, BoxError>;

    /// Drop counters whose window ended at or before `now`.
    async fn retain_recent(&self, now: u64) -> Result<usize, BoxError>;
}

/// Simple in-memory window store.
#[derive(Default, Clone, Debug)]
pub struct InMemoryWindowStore {
    // key -> (window_end_millis, hits)
    data: Arc<Mutex<HashMap<String, (u64, u32)>>>,
}

impl InMemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl WindowStore for InMemoryWindowStore {
    async fn hit(&self, key: &str, window_end: u64) -> Result<u32, BoxError> {
        let mut guard = self.data.lock().unwrap_or_else(|p| p.into_inner());
        let entry = guard.entry(key.to_string()).or_insert((window_end, 0));
        if entry.0 != window_end {
            *entry = (window_end, 0);
        }
        entry.1 = entry.1.saturating_add(1);
        Ok(entry.1)
    }

    async fn retain_recent(&self, now: u64) -> Result<usize, BoxError> {
        let mut guard = self.data.lock().unwrap_or_else(|p| p.into_inner());
        let before = guard.len();
        guard.retain(|_, (window_end, _)| *window_end > now);
        Ok(before - guard.len())
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    end: u64,
    remaining: Duration,
}

fn window_at(now: u64, window: Duration) -> Window {
    let len = u64::try_from(window.as_millis()).unwrap_or(u64::MAX).max(1);
    let end = (now - now % len).saturating_add(len);
    Window { end, remaining: Duration::from_millis(end - now) }
}

/// Hard stage: at most `limit` requests per window per key.
#[derive(Debug, Clone)]
pub struct FixedWindow {
    store: Arc<dyn WindowStore>,
    prefix: String,
    limit: u32,
    window: Duration,
    clock: Arc<dyn Clock>,
}

impl FixedWindow {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            store: Arc::new(InMemoryWindowStore::new()),
            prefix: String::new(),
            limit,
            window,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_store(mut self, store: Arc<dyn WindowStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }
}

#[async_trait]
impl RateLimiter for FixedWindow {
    async fn acquire(&self, identity: &str) -> Result<Decision, BoxError> {
        let window = window_at(self.clock.now_millis(), self.window);
        let key = format!("{}{}", self.prefix, identity);
        let hits = self.store.hit(&key, window.end).await?;

        if hits > self.limit {
            return Ok(Decision::Denied { wait: window.remaining, reason: "window_limit" });
        }
        Ok(Decision::Allowed { remaining: self.limit - hits, delay: Duration::ZERO })
    }
}

/// Soft stage: delays requests beyond `delay_after` in a window.
///
/// The n-th request past the threshold waits `n * delay`.
#[derive(Debug, Clone)]
pub struct SlowDown {
    store: Arc<dyn WindowStore>,
    prefix: String,
    delay_after: u32,
    delay: Duration,
    window: Duration,
    clock: Arc<dyn Clock>,
}

impl SlowDown {
    pub fn new(delay_after: u32, delay: Duration, window: Duration) -> Self {
        Self {
            store: Arc::new(InMemoryWindowStore::new()),
            prefix: String::new(),
            delay_after,
            delay,
            window,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_store(mut self, store: Arc<dyn WindowStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

#[async_trait]
impl RateLimiter for SlowDown {
    async fn acquire(&self, identity: &str) -> Result<Decision, BoxError> {
        let window = window_at(self.clock.now_millis(), self.window);
        let key = format!("{}{}", self.prefix, identity);
        let hits = self.store.hit(&key, window.end).await?;

        let excess = hits.saturating_sub(self.delay_after);
        Ok(Decision::Allowed {
            remaining: self.delay_after.saturating_sub(hits),
            delay: self.delay.saturating_mul(excess),
        })
    }
}

/// Parameters for one gated route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteLimits {
    /// Prepended to the client identity in every counter key.
    pub prefix: String,
    pub window: Duration,
    /// Hard stage maximum per window.
    pub limit: u32,
    /// Soft stage threshold per window.
    pub delay_after: u32,
    /// Soft stage step.
    pub delay: Duration,
}

impl RouteLimits {
    pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
    pub const DEFAULT_DELAY: Duration = Duration::from_millis(500);

    pub fn new(prefix: impl Into<String>, limit: u32, delay_after: u32) -> Self {
        Self {
            prefix: prefix.into(),
            window: Self::DEFAULT_WINDOW,
            limit,
            delay_after,
            delay: Self::DEFAULT_DELAY,
        }
    }

    /// `/api/query`: 10 per minute, slowed after 5.
    pub fn query() -> Self {
        Self::new("query-", 10, 5)
    }

    /// `GET /api/like`: 100 per minute.
    pub fn like_read() -> Self {
        Self::new("like-get-", 100, 100)
    }

    /// `POST /api/like`: 20 per minute.
    pub fn like_write() -> Self {
        Self::new("like-post-", 20, 20)
    }
}

/// Soft stage followed by hard stage, for one route.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    prefix: String,
    soft: SlowDown,
    hard: FixedWindow,
    soft_store: Arc<dyn WindowStore>,
    hard_store: Arc<dyn WindowStore>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    telemetry: Telemetry,
}

impl AdmissionGate {
    pub fn new(limits: &RouteLimits) -> Self {
        Self::with_clock(limits, Arc::new(SystemClock))
    }

    pub fn with_clock(limits: &RouteLimits, clock: Arc<dyn Clock>) -> Self {
        let soft_store: Arc<dyn WindowStore> = Arc::new(InMemoryWindowStore::new());
        let hard_store: Arc<dyn WindowStore> = Arc::new(InMemoryWindowStore::new());
        Self {
            prefix: limits.prefix.clone(),
            soft: SlowDown::new(limits.delay_after, limits.delay, limits.window)
                .with_prefix(limits.prefix.clone())
                .with_store(soft_store.clone())
                .with_clock(clock.clone()),
            hard: FixedWindow::new(limits.limit, limits.window)
                .with_prefix(limits.prefix.clone())
                .with_store(hard_store.clone())
                .with_clock(clock.clone()),
            soft_store,
            hard_store,
            clock,
            sleeper: Arc::new(TokioSleeper),
            telemetry: Telemetry::log(),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Admit or reject one request from `identity`.
    ///
    /// Waits out any soft-stage delay before consulting the hard stage. A hard
    /// denial is `RateLimited`; the caller must not proceed. Store failures
    /// come back as `Inner(GatewayError::Store)`.
    pub async fn check(&self, identity: &str) -> Result<(), ResilienceError<GatewayError>> {
        let key = format!("{}{}", self.prefix, identity);

        if let Decision::Allowed { delay, .. } = self.soft.acquire(identity).await.map_err(store_error)? {
            if !delay.is_zero() {
                tracing::debug!(key = %key, ?delay, "slowing client down");
                self.telemetry
                    .emit(PolicyEvent::Admission(AdmissionEvent::Delayed { key: key.clone(), delay }))
                    .await;
                self.sleeper.sleep(delay).await;
            }
        }

        match self.hard.acquire(identity).await.map_err(store_error)? {
            Decision::Allowed { .. } => Ok(()),
            Decision::Denied { wait, reason } => {
                tracing::warn!(key = %key, ?wait, reason, "request rejected");
                self.telemetry
                    .emit(PolicyEvent::Admission(AdmissionEvent::Rejected { key, wait }))
                    .await;
                Err(ResilienceError::RateLimited { wait })
            }
        }
    }

    /// Drop counters for windows that have rolled over.
    pub async fn prune(&self) -> Result<usize, GatewayError> {
        let now = self.clock.now_millis();
        let soft = self.soft_store.retain_recent(now).await.map_err(|e| GatewayError::Store(e.to_string()))?;
        let hard = self.hard_store.retain_recent(now).await.map_err(|e| GatewayError::Store(e.to_string()))?;
        Ok(soft + hard)
    }
}

fn store_error(err: BoxError) -> ResilienceError<GatewayError> {
    ResilienceError::Inner(GatewayError::Store(err.to_string()))
}
