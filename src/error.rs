//! Error types for policies and for the gateway as a whole.
//!
//! [`ResilienceError`] is what the individual policies (retry, timeout,
//! admission) return; it wraps the caller's own error in `Inner`.
//! [`GatewayError`] is the taxonomy the orchestrator and the HTTP layer speak.
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::quota::QuotaError;

/// Cap the number of stored failures inside RetryExhausted to avoid unbounded growth.
pub const MAX_RETRY_FAILURES: usize = 10;

/// Unified error type for all resilience policies
#[derive(Debug, Clone)]
pub enum ResilienceError<E> {
    /// The operation exceeded the timeout duration
    Timeout { elapsed: Duration, timeout: Duration },
    /// The admission gate refused the request
    RateLimited { wait: Duration },
    /// All retry attempts were exhausted
    RetryExhausted { attempts: usize, failures: Arc<Vec<ResilienceError<E>>> },
    /// The underlying operation failed
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { elapsed, timeout } => {
                write!(f, "operation timed out after {:?} (limit: {:?})", elapsed, timeout)
            }
            Self::RateLimited { wait } => {
                write!(f, "rate limited; retry after {:?}", wait)
            }
            Self::RetryExhausted { attempts, failures } => match failures.last() {
                Some(last) => {
                    write!(f, "retry exhausted after {} attempts; last error: {}", attempts, last)
                }
                None => write!(f, "retry exhausted after {} attempts; no recorded failures", attempts),
            },
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ResilienceError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RetryExhausted { failures, .. } => {
                failures.last().map(|e| e as &dyn std::error::Error)
            }
            _ => None,
        }
    }
}

impl<E> ResilienceError<E> {
    /// Construct a `RetryExhausted` variant, keeping only the most recent
    /// `MAX_RETRY_FAILURES` failures.
    pub fn retry_exhausted(attempts: usize, failures: Vec<ResilienceError<E>>) -> Self {
        let trimmed = if failures.len() > MAX_RETRY_FAILURES {
            failures.into_iter().rev().take(MAX_RETRY_FAILURES).rev().collect()
        } else {
            failures
        };
        ResilienceError::RetryExhausted { attempts, failures: Arc::new(trimmed) }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }

    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Borrow the inner error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Recorded failures for RetryExhausted, oldest first.
    pub fn failures(&self) -> Option<&[ResilienceError<E>]> {
        match self {
            Self::RetryExhausted { failures, .. } => Some(failures.as_slice()),
            _ => None,
        }
    }

    /// The failure that ended a retry loop, or `self` for any other variant.
    pub fn last_failure(&self) -> &ResilienceError<E> {
        match self {
            Self::RetryExhausted { failures, .. } => match failures.last() {
                Some(last) => last.last_failure(),
                None => self,
            },
            other => other,
        }
    }
}

/// Everything the gateway can fail with, as seen by request handlers.
///
/// Only [`GatewayError::AdmissionRejected`] is surfaced to clients as its own
/// status; every other variant is turned into fallback content.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("admission rejected; retry after {retry_after:?}")]
    AdmissionRejected { retry_after: Duration },
    #[error("quota exhausted for {key}: consumed {consumed} of {max}")]
    QuotaExhausted { key: String, consumed: i64, max: i64 },
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("{0} is not configured")]
    NoCredential(&'static str),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("serialization failed: {0}")]
    Serialization(String),
    #[error(transparent)]
    Quota(#[from] QuotaError),
    #[error("result store failed: {0}")]
    Store(String),
}

impl GatewayError {
    pub fn is_admission_rejected(&self) -> bool {
        matches!(self, Self::AdmissionRejected { .. })
    }

    /// `true` for conditions that mean "feature off" rather than "broken".
    pub fn is_disabled(&self) -> bool {
        matches!(self, Self::NoCredential(_))
    }

    /// Whether another attempt at the same upstream call could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::UpstreamUnavailable(_) | Self::Serialization(_) | Self::Store(_))
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        Self::UpstreamUnavailable(err.to_string())
    }
}

impl From<ResilienceError<GatewayError>> for GatewayError {
    fn from(err: ResilienceError<GatewayError>) -> Self {
        match err.last_failure() {
            ResilienceError::Inner(e) => e.clone(),
            ResilienceError::Timeout { timeout, .. } => {
                Self::UpstreamUnavailable(format!("timed out after {:?}", timeout))
            }
            ResilienceError::RateLimited { wait } => Self::AdmissionRejected { retry_after: *wait },
            ResilienceError::RetryExhausted { attempts, .. } => {
                Self::UpstreamUnavailable(format!("gave up after {} attempts", attempts))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct DummyError(&'static str);
    impl fmt::Display for DummyError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }
    impl std::error::Error for DummyError {}

    #[test]
    fn timeout_error_display() {
        let err: ResilienceError<DummyError> = ResilienceError::Timeout {
            elapsed: Duration::from_millis(5100),
            timeout: Duration::from_secs(5),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("timed out"));
        assert!(msg.contains("5.1"));
    }

    #[test]
    fn retry_exhausted_display_includes_last_error() {
        let err = ResilienceError::retry_exhausted(
            3,
            vec![ResilienceError::Inner(DummyError("first")), ResilienceError::Inner(DummyError("last"))],
        );
        let msg = format!("{}", err);
        assert!(msg.contains("3 attempts"));
        assert!(msg.ends_with("last error: last"));
    }

    #[test]
    fn retry_exhausted_display_handles_empty_failures() {
        let err: ResilienceError<DummyError> = ResilienceError::retry_exhausted(3, vec![]);
        assert!(format!("{}", err).contains("no recorded failures"));
    }

    #[test]
    fn retry_exhausted_caps_failures() {
        let failures = (0..25).map(|_| ResilienceError::Inner(DummyError("x"))).collect();
        let err = ResilienceError::retry_exhausted(25, failures);
        assert_eq!(err.failures().map(<[_]>::len), Some(MAX_RETRY_FAILURES));
    }

    #[test]
    fn last_failure_unwraps_retry_exhaustion() {
        let err = ResilienceError::retry_exhausted(
            2,
            vec![
                ResilienceError::Inner(DummyError("one")),
                ResilienceError::Timeout {
                    elapsed: Duration::from_secs(30),
                    timeout: Duration::from_secs(30),
                },
            ],
        );
        assert!(err.last_failure().is_timeout());
        assert!(err.source().is_some());
    }

    #[test]
    fn predicates_cover_variants() {
        let limited: ResilienceError<DummyError> =
            ResilienceError::RateLimited { wait: Duration::from_secs(1) };
        assert!(limited.is_rate_limited());
        assert!(!limited.is_timeout());
        assert!(limited.as_inner().is_none());

        let inner = ResilienceError::Inner(DummyError("x"));
        assert_eq!(inner.as_inner(), Some(&DummyError("x")));
        assert_eq!(inner.into_inner(), Some(DummyError("x")));
    }

    #[test]
    fn gateway_error_from_policy_errors() {
        let exhausted = ResilienceError::retry_exhausted(
            3,
            vec![ResilienceError::Inner(GatewayError::UpstreamUnavailable("503".into()))],
        );
        assert_eq!(GatewayError::from(exhausted), GatewayError::UpstreamUnavailable("503".into()));

        let timeout: ResilienceError<GatewayError> = ResilienceError::Timeout {
            elapsed: Duration::from_secs(30),
            timeout: Duration::from_secs(30),
        };
        assert!(matches!(GatewayError::from(timeout), GatewayError::UpstreamUnavailable(_)));

        let limited: ResilienceError<GatewayError> =
            ResilienceError::RateLimited { wait: Duration::from_secs(7) };
        assert!(GatewayError::from(limited).is_admission_rejected());
    }

    #[test]
    fn no_credential_counts_as_disabled() {
        assert!(GatewayError::NoCredential("OPENAI_API_KEY").is_disabled());
        assert!(!GatewayError::InvalidInput("value".into()).is_disabled());
        assert!(!GatewayError::NoCredential("OPENAI_API_KEY").is_retryable());
        assert!(GatewayError::UpstreamUnavailable("502".into()).is_retryable());
    }
}
