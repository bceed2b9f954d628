//! Process-wide state, built once at startup and shared by every handler.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::admission::AdmissionGate;
use crate::backend::{
    CompletionBackend, HttpSearchBackend, InMemoryResultStore, OpenAiCompletionBackend, ResultStore,
    SearchBackend,
};
use crate::cache::SingleFlightCache;
use crate::config::{ConfigError, GatewayConfig};
use crate::error::GatewayError;
use crate::orchestrator::RequestOrchestrator;
use crate::quota::{QuotaLimiter, QuotaPeriod, COMPLETION_COUNTER};
use crate::retry::RetryPolicy;
use crate::service::QueryService;
use crate::timeout::TimeoutPolicy;

/// Admission gates, one per gated route.
#[derive(Debug, Clone)]
pub struct RouteGates {
    pub query: AdmissionGate,
    pub like_read: AdmissionGate,
    pub like_write: AdmissionGate,
}

impl RouteGates {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            query: AdmissionGate::new(&config.query_limits),
            like_read: AdmissionGate::new(&config.like_read_limits),
            like_write: AdmissionGate::new(&config.like_write_limits),
        }
    }

    async fn prune(&self) -> Result<usize, GatewayError> {
        Ok(self.query.prune().await? + self.like_read.prune().await? + self.like_write.prune().await?)
    }
}

#[derive(Debug)]
pub struct Gateway {
    service: QueryService,
    gates: RouteGates,
    shutdown: watch::Sender<bool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Gateway {
    /// Wire up backends, policies, and gates from `config`.
    pub fn new(config: &GatewayConfig) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let client = reqwest::Client::new();

        let search: Arc<dyn SearchBackend> =
            Arc::new(HttpSearchBackend::new(client.clone(), config.search_url.clone()));
        let completions: Arc<dyn CompletionBackend> = Arc::new(OpenAiCompletionBackend::new(
            client,
            config.openai_url.clone(),
            config.openai_api_key.clone(),
            config.openai_model.clone(),
        ));
        let store: Arc<dyn ResultStore> = Arc::new(InMemoryResultStore::new());

        let retry = RetryPolicy::builder()
            .name("upstream")
            .max_attempts(config.retry_attempts)
            .delay(config.retry_delay)
            .should_retry(GatewayError::is_retryable)
            .build()?;
        let orchestrator = RequestOrchestrator::new(
            Arc::new(SingleFlightCache::new()),
            Arc::new(QuotaLimiter::new().with_counter(
                COMPLETION_COUNTER,
                config.token_budget,
                QuotaPeriod::Month,
            )),
            retry,
            TimeoutPolicy::new(config.upstream_timeout),
        );

        let service = QueryService::new(orchestrator, search, completions, store);
        Ok(Self::from_parts(service, RouteGates::from_config(config)))
    }

    /// Assemble a gateway from prebuilt parts.
    pub fn from_parts(service: QueryService, gates: RouteGates) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self { service, gates, shutdown, sweeper: Mutex::new(None) })
    }

    pub fn service(&self) -> &QueryService {
        &self.service
    }

    pub fn gates(&self) -> &RouteGates {
        &self.gates
    }

    /// Resolves once [`shutdown`](Self::shutdown) has been called.
    pub fn shutdown_signal(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut rx = self.shutdown.subscribe();
        async move {
            let _ = rx.wait_for(|stopped| *stopped).await;
        }
    }

    /// Start purging expired cache entries and admission windows every
    /// `interval`. Calling it again replaces the running sweeper.
    pub fn start_sweeper(self: &Arc<Self>, interval: std::time::Duration) {
        let cache_sweeper = self
            .service
            .orchestrator()
            .cache()
            .clone()
            .spawn_sweeper(interval, self.shutdown.subscribe());

        let gateway = Arc::downgrade(self);
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(gateway) = gateway.upgrade() else { break };
                        match gateway.gates.prune().await {
                            Ok(0) => {}
                            Ok(pruned) => tracing::debug!(pruned, "pruned admission windows"),
                            Err(err) => tracing::warn!(error = %err, "failed to prune admission windows"),
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            let _ = cache_sweeper.await;
        });

        let previous = self.sweeper.lock().unwrap_or_else(|p| p.into_inner()).replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Stop background work and release anything waiting on
    /// [`shutdown_signal`](Self::shutdown_signal).
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let sweeper = self.sweeper.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = sweeper {
            let _ = handle.await;
        }
        tracing::info!("gateway shut down");
    }
}
