//! Timeout policy implementation
//!
//! Upstream calls that run past the deadline are dropped (which aborts the
//! in-flight request) and reported as `ResilienceError::Timeout`, which the
//! retry policy treats as a failed attempt.

use crate::telemetry::{PolicyEvent, Telemetry, TimeoutEvent};
use crate::ResilienceError;
use std::future::Future;
use std::time::{Duration, Instant};

/// Deadline applied to every upstream call.
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct TimeoutPolicy {
    duration: Duration,
    telemetry: Telemetry,
}

impl TimeoutPolicy {
    /// Create a timeout policy. Panics if duration is zero or `Duration::MAX`.
    pub fn new(duration: Duration) -> Self {
        assert!(
            duration > Duration::ZERO && duration < Duration::MAX,
            "timeout duration must be non-zero and finite",
        );
        Self { duration, telemetry: Telemetry::log() }
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Inspect the configured timeout duration.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        let start = Instant::now();

        match tokio::time::timeout(self.duration, operation()).await {
            Ok(result) => result,
            Err(_) => {
                let elapsed = start.elapsed();
                self.telemetry
                    .emit(PolicyEvent::Timeout(TimeoutEvent::Occurred { timeout: self.duration }))
                    .await;
                Err(ResilienceError::Timeout { elapsed, timeout: self.duration })
            }
        }
    }
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_UPSTREAM_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::MemorySink;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    #[tokio::test(start_paused = true)]
    async fn test_completes_before_timeout() {
        let timeout = TimeoutPolicy::new(Duration::from_millis(100));

        let result = timeout
            .execute(|| async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok::<_, ResilienceError<TestError>>(42)
            })
            .await;

        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_long_operation() {
        let sink = MemorySink::new();
        let timeout =
            TimeoutPolicy::new(Duration::from_secs(30)).with_telemetry(Telemetry::new(sink.clone()));

        let result = timeout
            .execute(|| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, ResilienceError<TestError>>(42)
            })
            .await;

        match result.unwrap_err() {
            ResilienceError::Timeout { timeout, .. } => assert_eq!(timeout, Duration::from_secs(30)),
            e => panic!("Expected Timeout error, got {:?}", e),
        }
        assert_eq!(
            sink.events(),
            vec![PolicyEvent::Timeout(TimeoutEvent::Occurred { timeout: Duration::from_secs(30) })]
        );
    }

    #[tokio::test]
    async fn test_propagates_operation_errors() {
        let timeout = TimeoutPolicy::default();

        let result = timeout
            .execute(|| async {
                Err::<(), _>(ResilienceError::Inner(TestError("operation failed".to_string())))
            })
            .await;

        assert_eq!(result.unwrap_err().into_inner(), Some(TestError("operation failed".into())));
    }

    #[test]
    fn default_is_thirty_seconds() {
        assert_eq!(TimeoutPolicy::default().duration(), Duration::from_secs(30));
    }

    #[test]
    #[should_panic(expected = "non-zero")]
    fn zero_duration_panics() {
        let _ = TimeoutPolicy::new(Duration::ZERO);
    }
}
