//! Single-flight result cache with TTL.
//!
//! [`SingleFlightCache::getset`] guarantees that, for any key, at most one
//! producer runs at a time. The first caller to find a key absent (or
//! expired) becomes the *leader*: it parks a pending slot in the map, runs the
//! producer, and publishes the outcome. Callers arriving while the slot is
//! pending become *waiters* and receive a clone of whatever the leader
//! settles with, success or error.
//!
//! Lifecycle of a key: `Absent -> Pending -> Ready | Absent`. Failures are
//! never stored. A ready entry becomes absent again once its TTL elapses;
//! expiry is checked lazily on every read, and [`SingleFlightCache::spawn_sweeper`]
//! can reclaim memory in the background.
//!
//! If a leader is dropped before it settles (its request was cancelled), the
//! pending slot is removed and the waiters hold a fresh election, so one of
//! them runs the producer instead.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::clock::{Clock, SystemClock};
use crate::telemetry::{CacheEvent, PolicyEvent, Telemetry};

/// TTL for LLM completions.
pub const COMPLETION_TTL: Duration = Duration::from_secs(30 * 24 * 3600);
/// TTL for search results.
pub const SEARCH_TTL: Duration = Duration::from_secs(24 * 3600);

type Settled<V, E> = Option<Result<V, E>>;

enum Slot<V, E> {
    Ready { value: V, expires_at: u64 },
    Pending { id: u64, rx: watch::Receiver<Settled<V, E>> },
}

enum Election<V, E> {
    Hit(V),
    Follow(watch::Receiver<Settled<V, E>>),
    Lead { id: u64, tx: watch::Sender<Settled<V, E>> },
}

/// Keyed TTL cache whose `getset` collapses concurrent computations.
pub struct SingleFlightCache<V, E> {
    slots: Mutex<HashMap<String, Slot<V, E>>>,
    clock: Arc<dyn Clock>,
    telemetry: Telemetry,
    next_id: AtomicU64,
}

impl<V, E> std::fmt::Debug for SingleFlightCache<V, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlightCache").field("clock", &self.clock).finish_non_exhaustive()
    }
}

impl<V, E> Default for SingleFlightCache<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V, E> SingleFlightCache<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            clock,
            telemetry: Telemetry::log(),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Slot<V, E>>> {
        self.slots.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn expiry(&self, ttl: Duration) -> u64 {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        self.clock.now_millis().saturating_add(ttl_ms)
    }

    /// Live value for `key`, if any. Pending computations read as absent.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now_millis();
        match self.lock().get(key) {
            Some(Slot::Ready { value, expires_at }) if now < *expires_at => Some(value.clone()),
            _ => None,
        }
    }

    /// Store `value` unconditionally, resetting its expiry.
    pub fn set(&self, key: &str, value: V, ttl: Duration) {
        let expires_at = self.expiry(ttl);
        self.lock().insert(key.to_string(), Slot::Ready { value, expires_at });
    }

    /// Return the live value for `key`, or compute it with `producer`.
    ///
    /// Concurrent callers for the same key share one producer invocation and
    /// all observe its outcome. Errors are handed to every waiter and are not
    /// cached.
    pub async fn getset<F, Fut>(&self, key: &str, ttl: Duration, producer: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let (id, tx) = loop {
            match self.elect(key) {
                Election::Hit(value) => {
                    self.emit(CacheEvent::Hit { key: key.to_string() }).await;
                    return Ok(value);
                }
                Election::Follow(mut rx) => {
                    self.emit(CacheEvent::Joined { key: key.to_string() }).await;
                    let settled = rx.wait_for(Option::is_some).await.map(|s| s.clone());
                    match settled {
                        Ok(Some(result)) => return result,
                        // leader went away without settling; run a new election
                        _ => continue,
                    }
                }
                Election::Lead { id, tx } => break (id, tx),
            }
        };

        let mut guard = PendingGuard { slots: &self.slots, key, id, armed: true };
        tracing::debug!(key, "computing cache entry");
        let result = producer().await;

        {
            let mut slots = self.lock();
            let ours = matches!(slots.get(key), Some(Slot::Pending { id: pending, .. }) if *pending == id);
            match &result {
                Ok(value) => {
                    let expires_at = self.expiry(ttl);
                    slots.insert(key.to_string(), Slot::Ready { value: value.clone(), expires_at });
                }
                Err(_) if ours => {
                    slots.remove(key);
                }
                Err(_) => {}
            }
            guard.armed = false;
        }
        tx.send_replace(Some(result.clone()));

        let event = match &result {
            Ok(_) => CacheEvent::Stored { key: key.to_string(), ttl },
            Err(_) => CacheEvent::Failed { key: key.to_string() },
        };
        self.emit(event).await;
        result
    }

    fn elect(&self, key: &str) -> Election<V, E> {
        let now = self.clock.now_millis();
        let mut slots = self.lock();
        match slots.get(key) {
            Some(Slot::Ready { value, expires_at }) if now < *expires_at => {
                return Election::Hit(value.clone());
            }
            Some(Slot::Pending { rx, .. }) => return Election::Follow(rx.clone()),
            _ => {}
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);
        slots.insert(key.to_string(), Slot::Pending { id, rx });
        Election::Lead { id, tx }
    }

    async fn emit(&self, event: CacheEvent) {
        self.telemetry.emit(PolicyEvent::Cache(event)).await;
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let mut slots = self.lock();
        let before = slots.len();
        slots.retain(|_, slot| match slot {
            Slot::Ready { expires_at, .. } => now < *expires_at,
            Slot::Pending { .. } => true,
        });
        before - slots.len()
    }

    /// Number of slots, pending computations included.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Purge expired entries every `interval` until `shutdown` flips to `true`
    /// or its sender is dropped.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let purged = self.purge_expired();
                        if purged > 0 {
                            tracing::debug!(purged, "swept expired cache entries");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

/// Removes the leader's pending slot if the leader is dropped mid-computation.
struct PendingGuard<'a, V, E> {
    slots: &'a Mutex<HashMap<String, Slot<V, E>>>,
    key: &'a str,
    id: u64,
    armed: bool,
}

impl<V, E> Drop for PendingGuard<'_, V, E> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        if matches!(slots.get(self.key), Some(Slot::Pending { id, .. }) if *id == self.id) {
            slots.remove(self.key);
        }
    }
}

/// Deterministic cache key: `prefix` followed by the hex SHA-256 of `material`.
pub fn hashed_key(prefix: &str, material: &str) -> String {
    let digest = Sha256::digest(material.as_bytes());
    format!("{}{}", prefix, hex::encode(digest))
}
