mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rampart::backend::{SearchBackend, SearchHit, SearchParams};
use rampart::{GatewayError, SingleFlightCache, Telemetry};
use tokio::sync::Notify;

#[tokio::test]
async fn many_callers_one_upstream_call() {
    let cache: Arc<SingleFlightCache<String, GatewayError>> =
        Arc::new(SingleFlightCache::new().with_telemetry(Telemetry::null()));
    let calls = Arc::new(AtomicUsize::new(0));
    let release = Arc::new(Notify::new());

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let cache = cache.clone();
        let calls = calls.clone();
        let release = release.clone();
        tasks.push(tokio::spawn(async move {
            cache
                .getset("journalists", Duration::from_secs(60), || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    release.notified().await;
                    Ok::<_, GatewayError>("answer".to_string())
                })
                .await
        }));
    }

    while calls.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    release.notify_one();

    for task in futures::future::join_all(tasks).await {
        assert_eq!(task.unwrap().unwrap(), "answer");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.get("journalists").as_deref(), Some("answer"));
}

#[tokio::test]
async fn failures_are_not_cached() {
    let cache: SingleFlightCache<u32, GatewayError> =
        SingleFlightCache::new().with_telemetry(Telemetry::null());

    let first = cache
        .getset("k", Duration::from_secs(60), || async {
            Err(GatewayError::UpstreamUnavailable("boom".into()))
        })
        .await;
    assert!(first.is_err());
    assert!(cache.get("k").is_none());

    let second = cache.getset("k", Duration::from_secs(60), || async { Ok(7) }).await;
    assert_eq!(second.unwrap(), 7);
    assert_eq!(cache.get("k"), Some(7));
}

#[tokio::test]
async fn distinct_keys_do_not_share_results() {
    let search = Arc::new(common::FakeSearch::with_hits(2));
    let orchestrator = common::orchestrator(1_000);

    for key in ["a", "b", "a", "b"] {
        let search = search.clone();
        let hits: Vec<SearchHit> = orchestrator
            .fetch(key, Duration::from_secs(60), move || {
                let search = search.clone();
                async move {
                    let params = SearchParams {
                        q: key.to_string(),
                        max_results: 2,
                        time: None,
                        region: None,
                    };
                    search.search(&params).await
                }
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
    }
    assert_eq!(search.calls(), 2);
}
