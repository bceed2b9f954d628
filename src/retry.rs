//! Retry policy implementation
//!
//! Bounded-patience wrapper around flaky upstream calls.
//!
//! Semantics:
//! - `max_attempts` counts total attempts (initial try + retries).
//! - The delay between attempts is constant; it never grows.
//! - `ResilienceError::Inner(E)` and `ResilienceError::Timeout` are retried;
//!   `RateLimited` and nested `RetryExhausted` return immediately.
//! - `should_retry` can mark an `Inner` error as permanent.
//! - Every failed attempt is logged and emitted as `RetryEvent::Attempt`
//!   before the policy sleeps.
//!
//! Invariants:
//! - Attempts never exceed `max_attempts`.
//! - Success after N attempts is returned exactly like first-try success.
//! - On exhaustion the last underlying error is available through
//!   [`ResilienceError::last_failure`].
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use rampart::{InstantSleeper, ResilienceError, RetryPolicy};
//!
//! #[derive(Debug)]
//! struct MyErr;
//! impl std::fmt::Display for MyErr { fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "oops") } }
//! impl std::error::Error for MyErr {}
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let policy = RetryPolicy::<MyErr>::builder()
//!     .max_attempts(3)
//!     .delay(Duration::from_millis(1000))
//!     .with_sleeper(InstantSleeper)
//!     .build()
//!     .unwrap();
//! let result: Result<(), ResilienceError<MyErr>> =
//!     policy.execute(|| async { Err(ResilienceError::Inner(MyErr)) }).await;
//! assert!(result.unwrap_err().is_retry_exhausted());
//! # });
//! ```

use crate::error::MAX_RETRY_FAILURES;
use crate::telemetry::{PolicyEvent, RetryEvent, Telemetry};
use crate::{ResilienceError, Sleeper, TokioSleeper};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default total attempts.
pub const DEFAULT_MAX_ATTEMPTS: usize = 3;
/// Default pause between attempts.
pub const DEFAULT_DELAY: Duration = Duration::from_millis(1000);

/// Retry policy with a fixed delay between attempts.
#[derive(Clone)]
pub struct RetryPolicy<E> {
    name: Arc<str>,
    max_attempts: usize,
    delay: Duration,
    should_retry: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    sleeper: Arc<dyn Sleeper>,
    telemetry: Telemetry,
}

impl<E> std::fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("name", &self.name)
            .field("max_attempts", &self.max_attempts)
            .field("delay", &self.delay)
            .field("sleeper", &"<sleeper>")
            .field("should_retry", &"<predicate>")
            .finish()
    }
}

impl<E> RetryPolicy<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Construct a new builder with defaults.
    pub fn builder() -> RetryPolicyBuilder<E> {
        RetryPolicyBuilder::new()
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Execute an async operation with retry semantics.
    pub async fn execute<T, Fut, Op>(&self, mut operation: Op) -> Result<T, ResilienceError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let started = Instant::now();
        let mut failures: VecDeque<ResilienceError<E>> = VecDeque::new();

        for attempt in 1..=self.max_attempts {
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(ResilienceError::Inner(e)) if !(self.should_retry)(&e) => {
                    return Err(ResilienceError::Inner(e));
                }
                Err(err @ (ResilienceError::Inner(_) | ResilienceError::Timeout { .. })) => err,
                Err(err) => return Err(err),
            };

            tracing::info!(
                name = %self.name,
                attempt,
                attempts_left = self.max_attempts - attempt,
                error = %err,
                "retrying after failure"
            );
            let rendered = err.to_string();
            failures.push_back(err);
            while failures.len() > MAX_RETRY_FAILURES {
                failures.pop_front();
            }

            if attempt >= self.max_attempts {
                break;
            }

            self.telemetry
                .emit(PolicyEvent::Retry(RetryEvent::Attempt {
                    attempt,
                    delay: self.delay,
                    error: rendered,
                }))
                .await;
            self.sleeper.sleep(self.delay).await;
        }

        self.telemetry
            .emit(PolicyEvent::Retry(RetryEvent::Exhausted {
                total_attempts: self.max_attempts,
                total_duration: started.elapsed(),
            }))
            .await;
        Err(ResilienceError::retry_exhausted(self.max_attempts, failures.into_iter().collect()))
    }
}

/// Builder for `RetryPolicy`.
pub struct RetryPolicyBuilder<E> {
    name: Arc<str>,
    max_attempts: usize,
    delay: Duration,
    should_retry: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    sleeper: Arc<dyn Sleeper>,
    telemetry: Telemetry,
}

/// Errors produced while building a retry policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    /// `max_attempts` must be > 0.
    #[error("max_attempts must be > 0 (got {0})")]
    InvalidMaxAttempts(usize),
}

impl<E> RetryPolicyBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            name: Arc::from("func"),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: DEFAULT_DELAY,
            should_retry: Arc::new(|_| true),
            sleeper: Arc::new(TokioSleeper),
            telemetry: Telemetry::log(),
        }
    }

    /// Label used in log lines.
    pub fn name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = name.into();
        self
    }

    /// Set total attempts (initial + retries). Must be > 0.
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Constant pause between attempts.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Predicate to decide if an `Inner` error is retryable.
    pub fn should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    /// Provide a custom sleeper implementation.
    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Build the retry policy, validating inputs.
    pub fn build(self) -> Result<RetryPolicy<E>, BuildError> {
        if self.max_attempts == 0 {
            return Err(BuildError::InvalidMaxAttempts(0));
        }
        Ok(RetryPolicy {
            name: self.name,
            max_attempts: self.max_attempts,
            delay: self.delay,
            should_retry: self.should_retry,
            sleeper: self.sleeper,
            telemetry: self.telemetry,
        })
    }
}

impl<E> Default for RetryPolicyBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
