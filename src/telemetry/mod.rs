//! Telemetry for the orchestration layer.
//!
//! Policies report what they did as [`PolicyEvent`]s. Events flow through
//! sinks implementing `tower::Service<PolicyEvent>`; [`Telemetry`] is the
//! type-erased handle the policies hold.
//!
//! # Event Types
//!
//! - **Retry**: `Attempt`, `Exhausted`
//! - **Timeout**: `Occurred`
//! - **Cache**: `Hit`, `Joined`, `Stored`, `Failed`
//! - **Quota**: `Reserved`, `Exhausted`
//! - **Admission**: `Delayed`, `Rejected`

pub mod events;
pub mod sinks;

pub use events::{
    AdmissionEvent, CacheEvent, PolicyEvent, QuotaEvent, RetryEvent, TimeoutEvent,
};
pub use sinks::{emit_best_effort, LogSink, MemorySink, NullSink, TelemetrySink};

use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use tower::util::BoxCloneService;

/// Shareable handle to a telemetry sink.
///
/// Cloning is cheap; every clone feeds the same sink.
#[derive(Clone)]
pub struct Telemetry {
    sink: Arc<Mutex<BoxCloneService<PolicyEvent, (), Infallible>>>,
}

impl Telemetry {
    pub fn new<S>(sink: S) -> Self
    where
        S: TelemetrySink<SinkError = Infallible>,
        S::Future: Send + 'static,
    {
        Self { sink: Arc::new(Mutex::new(BoxCloneService::new(sink))) }
    }

    /// Discard everything.
    pub fn null() -> Self {
        Self::new(NullSink)
    }

    /// Log through `tracing`.
    pub fn log() -> Self {
        Self::new(LogSink)
    }

    pub async fn emit(&self, event: PolicyEvent) {
        let sink = self.sink.lock().unwrap_or_else(|p| p.into_inner()).clone();
        emit_best_effort(sink, event).await;
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::log()
    }
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry").field("sink", &"<sink>").finish()
    }
}
