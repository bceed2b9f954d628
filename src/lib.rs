#![forbid(unsafe_code)]

//! # Rampart
//!
//! Request orchestration for costly, rate-limited upstreams: a search API and
//! an LLM completion API behind a small HTTP surface.
//!
//! ## Features
//!
//! - **Single-flight cache**: concurrent requests for one key share a single
//!   upstream call; results live for a TTL, failures are never stored
//! - **Advisory quotas**: named per-month (or per-day) usage counters
//! - **Retry + timeout**: bounded attempts with a constant delay, each attempt
//!   cut off after a fixed deadline
//! - **Admission control**: per-client soft slow-down and hard fixed-window cap
//! - **Telemetry**: every policy decision is a [`PolicyEvent`] sent to a
//!   `tower::Service` sink
//!
//! ## Quick Start
//!
//! ```rust
//! use rampart::{InstantSleeper, RequestOrchestrator, RetryPolicy, SingleFlightCache};
//! use rampart::{GatewayError, QuotaLimiter, QuotaPeriod, TimeoutPolicy};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let retry = RetryPolicy::builder()
//!         .max_attempts(3)
//!         .with_sleeper(InstantSleeper)
//!         .build()
//!         .unwrap();
//!     let orchestrator = RequestOrchestrator::new(
//!         Arc::new(SingleFlightCache::new()),
//!         Arc::new(QuotaLimiter::new().with_counter("tokens-", 1_000, QuotaPeriod::Month)),
//!         retry,
//!         TimeoutPolicy::new(Duration::from_secs(30)),
//!     );
//!
//!     let answer: String = orchestrator
//!         .fetch("greeting", Duration::from_secs(60), || async {
//!             Ok::<_, GatewayError>("hello".to_string())
//!         })
//!         .await
//!         .unwrap();
//!     assert_eq!(answer, "hello");
//! }
//! ```

pub mod admission;
pub mod backend;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod http;
pub mod orchestrator;
pub mod quota;
pub mod retry;
pub mod service;
pub mod sleeper;
pub mod telemetry;
pub mod timeout;

// Re-exports
pub use admission::{AdmissionGate, Decision, FixedWindow, RateLimiter, RouteLimits, SlowDown};
pub use cache::SingleFlightCache;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, GatewayConfig};
pub use error::{GatewayError, ResilienceError};
pub use gateway::Gateway;
pub use orchestrator::{Metered, RequestOrchestrator};
pub use quota::{QuotaError, QuotaLimiter, QuotaPeriod, QuotaSnapshot};
pub use retry::{BuildError, RetryPolicy, RetryPolicyBuilder};
pub use service::{QueryRequest, QueryResponse, QueryService};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use telemetry::{PolicyEvent, Telemetry};
pub use timeout::TimeoutPolicy;
