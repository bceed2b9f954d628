use std::fmt;
use std::time::Duration;

/// Events emitted while a request moves through the orchestration layer.
///
/// Every policy in this crate reports what it did through one of these; sinks
/// decide whether they are logged, collected, or dropped.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyEvent {
    /// Retry policy events
    Retry(RetryEvent),
    /// Timeout events
    Timeout(TimeoutEvent),
    /// Single-flight cache events
    Cache(CacheEvent),
    /// Quota accounting events
    Quota(QuotaEvent),
    /// Admission gate events
    Admission(AdmissionEvent),
}

/// Events emitted by retry policies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryEvent {
    /// An attempt failed and another one will be made after `delay`.
    Attempt {
        /// The attempt that failed (1-indexed)
        attempt: usize,
        /// Delay before the next attempt
        delay: Duration,
        /// Rendered error of the failed attempt
        error: String,
    },
    /// All attempts failed.
    Exhausted {
        total_attempts: usize,
        total_duration: Duration,
    },
}

/// Events emitted by timeout policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutEvent {
    /// A call exceeded its deadline and was aborted.
    Occurred { timeout: Duration },
}

/// Events emitted by the single-flight cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// A live entry was served.
    Hit { key: String },
    /// The caller joined a computation already in flight.
    Joined { key: String },
    /// The caller became leader and its producer succeeded.
    Stored { key: String, ttl: Duration },
    /// The leader's producer failed; nothing was cached.
    Failed { key: String },
}

/// Events emitted by the quota limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaEvent {
    /// Consumption was added to a counter.
    Reserved { key: String, amount: u64, consumed: i64, max: i64 },
    /// Metered work was skipped because nothing was left.
    Exhausted { key: String, consumed: i64, max: i64 },
}

/// Events emitted by the admission gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionEvent {
    /// The soft stage slowed a request down.
    Delayed { key: String, delay: Duration },
    /// The hard stage rejected a request.
    Rejected { key: String, wait: Duration },
}

impl fmt::Display for PolicyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyEvent::Retry(event) => write!(f, "Retry::{}", event),
            PolicyEvent::Timeout(event) => write!(f, "Timeout::{}", event),
            PolicyEvent::Cache(event) => write!(f, "Cache::{}", event),
            PolicyEvent::Quota(event) => write!(f, "Quota::{}", event),
            PolicyEvent::Admission(event) => write!(f, "Admission::{}", event),
        }
    }
}

impl fmt::Display for RetryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryEvent::Attempt { attempt, delay, error } => {
                write!(f, "Attempt(#{}, delay={:?}, error={})", attempt, delay, error)
            }
            RetryEvent::Exhausted { total_attempts, total_duration } => {
                write!(f, "Exhausted(attempts={}, duration={:?})", total_attempts, total_duration)
            }
        }
    }
}

impl fmt::Display for TimeoutEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutEvent::Occurred { timeout } => write!(f, "Occurred(timeout={:?})", timeout),
        }
    }
}

impl fmt::Display for CacheEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheEvent::Hit { key } => write!(f, "Hit({})", key),
            CacheEvent::Joined { key } => write!(f, "Joined({})", key),
            CacheEvent::Stored { key, ttl } => write!(f, "Stored({}, ttl={:?})", key, ttl),
            CacheEvent::Failed { key } => write!(f, "Failed({})", key),
        }
    }
}

impl fmt::Display for QuotaEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaEvent::Reserved { key, amount, consumed, max } => {
                write!(f, "Reserved({}, +{}, {}/{})", key, amount, consumed, max)
            }
            QuotaEvent::Exhausted { key, consumed, max } => {
                write!(f, "Exhausted({}, {}/{})", key, consumed, max)
            }
        }
    }
}

impl fmt::Display for AdmissionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionEvent::Delayed { key, delay } => write!(f, "Delayed({}, {:?})", key, delay),
            AdmissionEvent::Rejected { key, wait } => {
                write!(f, "Rejected({}, wait={:?})", key, wait)
            }
        }
    }
}
