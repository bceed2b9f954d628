#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rampart::backend::{
    ChatMessage, Completion, CompletionBackend, InMemoryResultStore, ResultStore, SearchBackend,
    SearchHit, SearchParams, VoteSubject, Votes,
};
use rampart::cache::SingleFlightCache;
use rampart::gateway::RouteGates;
use rampart::quota::COMPLETION_COUNTER;
use rampart::{
    AdmissionGate, Gateway, GatewayError, InstantSleeper, QueryService, QuotaLimiter, QuotaPeriod,
    RequestOrchestrator, RetryPolicy, RouteLimits, Telemetry, TimeoutPolicy,
};

/// Search backend returning canned hits.
#[derive(Debug, Default)]
pub struct FakeSearch {
    pub hits: Vec<SearchHit>,
    pub fail: bool,
    pub calls: AtomicUsize,
}

impl FakeSearch {
    pub fn with_hits(n: usize) -> Self {
        let hits = (1..=n)
            .map(|i| SearchHit {
                title: format!("Journalist {i}"),
                body: format!("Writes about things #{i}"),
                href: format!("https://news.example/{i}"),
            })
            .collect();
        Self { hits, ..Self::default() }
    }

    pub fn failing() -> Self {
        Self { fail: true, ..Self::default() }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SearchBackend for FakeSearch {
    async fn search(&self, _params: &SearchParams) -> Result<Vec<SearchHit>, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(GatewayError::UpstreamUnavailable("search is down".into()));
        }
        Ok(self.hits.clone())
    }
}

/// Completion backend answering every prompt with the same text.
#[derive(Debug, Default)]
pub struct FakeCompletions {
    pub disabled: bool,
    pub tokens: u64,
    pub calls: AtomicUsize,
}

impl FakeCompletions {
    pub fn answering(tokens: u64) -> Self {
        Self { tokens, ..Self::default() }
    }

    pub fn disabled() -> Self {
        Self { disabled: true, ..Self::default() }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionBackend for FakeCompletions {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<Completion, GatewayError> {
        if self.disabled {
            return Err(GatewayError::NoCredential("OPENAI_API_KEY"));
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Completion {
            text: format!("Summary of {} message(s)", messages.len()),
            tokens_consumed: self.tokens,
        })
    }
}

/// In-memory store that counts result-list writes.
#[derive(Debug, Default)]
pub struct CountingStore {
    inner: InMemoryResultStore,
    pub saves: AtomicUsize,
}

impl CountingStore {
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResultStore for CountingStore {
    async fn save_results(
        &self,
        industry: &str,
        country: &str,
        items: &[SearchHit],
    ) -> Result<String, GatewayError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.inner.save_results(industry, country, items).await
    }

    async fn save_chat(
        &self,
        industry: &str,
        country: &str,
        result_id: &str,
        prompt: &str,
        answer: &str,
    ) -> Result<String, GatewayError> {
        self.inner.save_chat(industry, country, result_id, prompt, answer).await
    }

    async fn record_vote(
        &self,
        session: &str,
        subject: &VoteSubject,
        upvote: i64,
    ) -> Result<bool, GatewayError> {
        self.inner.record_vote(session, subject, upvote).await
    }

    async fn get_votes(&self, subject: &VoteSubject) -> Result<Votes, GatewayError> {
        self.inner.get_votes(subject).await
    }
}

pub fn retry() -> RetryPolicy<GatewayError> {
    RetryPolicy::builder()
        .name("test")
        .max_attempts(3)
        .should_retry(GatewayError::is_retryable)
        .with_sleeper(InstantSleeper)
        .with_telemetry(Telemetry::null())
        .build()
        .unwrap()
}

pub fn orchestrator(budget: i64) -> RequestOrchestrator {
    RequestOrchestrator::new(
        Arc::new(SingleFlightCache::new().with_telemetry(Telemetry::null())),
        Arc::new(
            QuotaLimiter::new()
                .with_counter(COMPLETION_COUNTER, budget, QuotaPeriod::Month)
                .with_telemetry(Telemetry::null()),
        ),
        retry(),
        TimeoutPolicy::new(Duration::from_secs(30)).with_telemetry(Telemetry::null()),
    )
}

fn gate(limits: RouteLimits) -> AdmissionGate {
    AdmissionGate::new(&limits)
        .with_sleeper(Arc::new(InstantSleeper))
        .with_telemetry(Telemetry::null())
}

/// Gateway over fakes with the production route limits and instant delays.
pub fn gateway(
    search: Arc<FakeSearch>,
    completions: Arc<FakeCompletions>,
    budget: i64,
) -> Arc<Gateway> {
    gateway_with_store(search, completions, Arc::new(InMemoryResultStore::new()), budget)
}

pub fn gateway_with_store(
    search: Arc<FakeSearch>,
    completions: Arc<FakeCompletions>,
    store: Arc<dyn ResultStore>,
    budget: i64,
) -> Arc<Gateway> {
    let service = QueryService::new(orchestrator(budget), search, completions, store);
    let gates = RouteGates {
        query: gate(RouteLimits::query()),
        like_read: gate(RouteLimits::like_read()),
        like_write: gate(RouteLimits::like_write()),
    };
    Gateway::from_parts(service, gates)
}
