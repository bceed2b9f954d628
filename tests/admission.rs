use std::sync::Arc;
use std::time::Duration;

use rampart::{AdmissionGate, ManualClock, ResilienceError, RouteLimits, Telemetry, TrackingSleeper};

// aligned to a minute boundary
const T0: u64 = 1_700_000_040_000;

fn gate(limits: RouteLimits, clock: &ManualClock) -> (AdmissionGate, Arc<TrackingSleeper>) {
    let sleeper = Arc::new(TrackingSleeper::new());
    let gate = AdmissionGate::with_clock(&limits, Arc::new(clock.clone()))
        .with_sleeper(sleeper.clone())
        .with_telemetry(Telemetry::null());
    (gate, sleeper)
}

#[tokio::test]
async fn eleventh_query_in_a_minute_is_rejected() {
    let clock = ManualClock::new(T0);
    let (gate, sleeper) = gate(RouteLimits::query(), &clock);

    for _ in 0..10 {
        gate.check("203.0.113.7").await.unwrap();
    }
    clock.advance(15_000);
    match gate.check("203.0.113.7").await {
        Err(ResilienceError::RateLimited { wait }) => assert_eq!(wait, Duration::from_secs(45)),
        other => panic!("expected rejection, got {other:?}"),
    }

    let delays = sleeper.calls();
    assert_eq!(delays.len(), 6);
    assert_eq!(delays.first(), Some(&Duration::from_millis(500)));
    assert_eq!(delays.last(), Some(&Duration::from_millis(3000)));
}

#[tokio::test]
async fn clients_are_counted_separately() {
    let clock = ManualClock::new(T0);
    let (gate, _) = gate(RouteLimits::query(), &clock);

    for _ in 0..10 {
        gate.check("203.0.113.7").await.unwrap();
    }
    assert!(gate.check("203.0.113.7").await.is_err());
    gate.check("198.51.100.2").await.unwrap();
}

#[tokio::test]
async fn a_new_window_admits_again_without_delay() {
    let clock = ManualClock::new(T0);
    let (gate, sleeper) = gate(RouteLimits::query(), &clock);

    for _ in 0..11 {
        let _ = gate.check("client").await;
    }
    clock.advance(60_000);
    sleeper.clear();

    gate.check("client").await.unwrap();
    assert!(sleeper.calls().is_empty());
}

#[tokio::test]
async fn like_writes_slow_only_the_rejected_request() {
    let clock = ManualClock::new(T0);
    let (gate, sleeper) = gate(RouteLimits::like_write(), &clock);

    for _ in 0..20 {
        gate.check("client").await.unwrap();
    }
    assert!(sleeper.calls().is_empty());
    assert!(matches!(gate.check("client").await, Err(ResilienceError::RateLimited { .. })));
    assert_eq!(sleeper.calls(), vec![Duration::from_millis(500)]);
}

#[tokio::test]
async fn prune_drops_rolled_over_windows() {
    let clock = ManualClock::new(T0);
    let (gate, _) = gate(RouteLimits::like_read(), &clock);

    gate.check("a").await.unwrap();
    gate.check("b").await.unwrap();
    assert_eq!(gate.prune().await.unwrap(), 0);

    clock.advance(60_000);
    assert_eq!(gate.prune().await.unwrap(), 4);
}
