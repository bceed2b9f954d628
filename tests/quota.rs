mod common;

use std::sync::Arc;
use std::time::Duration;

use rampart::orchestrator::Metered;
use rampart::quota::InMemoryQuotaStore;
use rampart::{
    GatewayError, ManualClock, QuotaLimiter, QuotaPeriod, RequestOrchestrator, SingleFlightCache,
    Telemetry, TimeoutPolicy,
};

// 2024-05-31T23:59:59Z
const END_OF_MAY: u64 = 1_717_199_999_000;

fn orchestrator(clock: &ManualClock, max: i64) -> RequestOrchestrator {
    RequestOrchestrator::new(
        Arc::new(SingleFlightCache::with_clock(Arc::new(clock.clone())).with_telemetry(Telemetry::null())),
        Arc::new(
            QuotaLimiter::new()
                .with_counter("tokens-", max, QuotaPeriod::Month)
                .with_clock(Arc::new(clock.clone()))
                .with_telemetry(Telemetry::null()),
        ),
        common::retry(),
        TimeoutPolicy::new(Duration::from_secs(30)).with_telemetry(Telemetry::null()),
    )
}

async fn spend(orchestrator: &RequestOrchestrator, key: &str, cost: u64) -> Result<String, GatewayError> {
    orchestrator
        .metered(key, Duration::from_secs(60), "tokens-", move || async move {
            Ok(Metered { value: format!("spent {cost}"), cost })
        })
        .await
}

#[tokio::test]
async fn budget_may_be_overdrawn_by_the_last_call() {
    let clock = ManualClock::new(END_OF_MAY - 60_000);
    let orchestrator = orchestrator(&clock, 100);

    spend(&orchestrator, "first", 60).await.unwrap();
    spend(&orchestrator, "second", 60).await.unwrap();

    let usage = orchestrator.usage("tokens-").await.unwrap();
    assert_eq!(usage.key, "tokens-2024-05");
    assert_eq!(usage.consumed, 120);
    assert_eq!(usage.available, -20);

    let err = spend(&orchestrator, "third", 1).await.unwrap_err();
    assert!(matches!(err, GatewayError::QuotaExhausted { consumed: 120, max: 100, .. }));
}

#[tokio::test]
async fn a_new_month_restores_the_budget() {
    let clock = ManualClock::new(END_OF_MAY - 60_000);
    let orchestrator = orchestrator(&clock, 100);

    spend(&orchestrator, "big", 150).await.unwrap();
    assert!(spend(&orchestrator, "blocked", 1).await.is_err());

    clock.advance(120_000);
    assert_eq!(spend(&orchestrator, "blocked", 1).await.unwrap(), "spent 1");

    let usage = orchestrator.usage("tokens-").await.unwrap();
    assert_eq!(usage.key, "tokens-2024-06");
    assert_eq!(usage.consumed, 1);
}

#[tokio::test]
async fn limiters_sharing_a_store_share_the_budget() {
    let clock = ManualClock::new(END_OF_MAY);
    let store = Arc::new(InMemoryQuotaStore::new());
    let limiter = || {
        QuotaLimiter::new()
            .with_counter("tokens-", 100, QuotaPeriod::Day)
            .with_store(store.clone())
            .with_clock(Arc::new(clock.clone()))
            .with_telemetry(Telemetry::null())
    };
    let (a, b) = (limiter(), limiter());

    a.reserve("tokens-", 70).await.unwrap();
    let snapshot = b.reserve("tokens-", 40).await.unwrap();
    assert_eq!(snapshot.key, "tokens-2024-05-31");
    assert_eq!(snapshot.consumed, 110);
    assert_eq!(a.snapshot("tokens-").await.unwrap().available, -10);
}

#[tokio::test]
async fn tokens_are_counted_for_completions() {
    let completions = Arc::new(common::FakeCompletions::answering(42));
    let gateway = common::gateway(Arc::new(common::FakeSearch::with_hits(3)), completions.clone(), 1_000);

    let response = gateway
        .service()
        .query(rampart::QueryRequest {
            value: Some("climate".into()),
            country: Some("Norway".into()),
            ..Default::default()
        })
        .await;
    assert!(response.message.is_some());

    let usage = gateway.service().orchestrator().usage(rampart::quota::COMPLETION_COUNTER).await.unwrap();
    assert_eq!(usage.consumed, 42);
    assert_eq!(usage.available, 958);
    assert_eq!(completions.calls(), 1);
}
