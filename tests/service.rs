mod common;

use async_trait::async_trait;
use common::LogBuffer;
use std::sync::Arc;
use std::time::Duration;
use turnstile::clock::{ManualClock, MonotonicClock};
use turnstile::ports::MemoryMetricsSink;
use turnstile::{
    AlgorithmType, ClientIdentification, ClientType, InMemoryClientDirectory, InMemoryRateLimitRepository, RateLimit,
    RateLimitConfig, RateLimitError, RateLimitRepository, RateLimitService, ThrottlingStrategyType, TokioSleeper,
    TrackingSleeper,
};

fn config(strategy: ThrottlingStrategyType) -> RateLimitConfig {
    RateLimitConfig {
        default_algorithm: AlgorithmType::FixedWindow,
        default_throttling_strategy: strategy,
        requests_per_second: [(ClientType::Standard, 1), (ClientType::Internal, 1)].into_iter().collect(),
        ..RateLimitConfig::default()
    }
}

#[tokio::test]
async fn backoff_strategy_waits_longer_than_the_hint() {
    let sleeper = TrackingSleeper::new();
    let service = RateLimitService::builder(config(ThrottlingStrategyType::ExponentialBackoff))
        .clock(ManualClock::new(10_000))
        .sleeper(sleeper.clone())
        .build()
        .unwrap();

    service.check_rate_limit("/a", "c1").await.unwrap();
    let denied = service.check_rate_limit("/a", "c1").await.unwrap();
    assert_eq!(denied.retry_after(), Duration::from_secs(1));
    // 100 ms × 2^1
    assert_eq!(sleeper.calls(), vec![Duration::from_millis(200)]);
}

#[tokio::test(start_paused = true)]
async fn interrupt_cuts_a_delayed_request_short() {
    let service = Arc::new(
        RateLimitService::builder(config(ThrottlingStrategyType::Delay))
            .clock(ManualClock::new(10_000))
            .sleeper(TokioSleeper)
            .build()
            .unwrap(),
    );
    service.check_rate_limit("/a", "c1").await.unwrap();

    let waiting = {
        let service = service.clone();
        tokio::spawn(async move { service.check_rate_limit("/a", "c1").await })
    };
    tokio::task::yield_now().await;
    let interrupt = service.interrupt_handle();
    interrupt.interrupt();

    let err = waiting.await.expect("task panicked").unwrap_err();
    assert!(err.is_interrupted());
    assert_eq!(err.client_id(), Some("c1"));
    assert_eq!(err.retry_after(), Some(Duration::from_secs(1)));

    // The flag stays raised until cleared.
    assert!(service.check_rate_limit("/a", "c1").await.unwrap_err().is_interrupted());
    interrupt.clear();
    assert!(!service.check_rate_limit("/a", "c1").await.unwrap().is_allowed());
}

#[tokio::test]
async fn internal_clients_are_unrestricted_and_unknown_tiers_fail() {
    let clients = Arc::new(InMemoryClientDirectory::new());
    clients.update_client_type("svc", ClientType::Internal).await;
    clients.update_client_type("vip", ClientType::Vip).await;
    let service = RateLimitService::builder(config(ThrottlingStrategyType::Reject))
        .clock(ManualClock::new(10_000))
        .clients(clients)
        .build()
        .unwrap();

    for _ in 0..10 {
        assert!(service.check_rate_limit("/a", "svc").await.unwrap().is_allowed());
    }
    let err = service.check_rate_limit("/a", "vip").await.unwrap_err();
    assert!(matches!(err, RateLimitError::UnsupportedClientType(_)));
}

#[tokio::test]
async fn outcomes_reach_the_metrics_sink_per_endpoint() {
    let metrics = Arc::new(MemoryMetricsSink::new());
    let service = RateLimitService::builder(config(ThrottlingStrategyType::Delay))
        .clock(ManualClock::new(10_000))
        .sleeper(TrackingSleeper::new())
        .metrics(metrics.clone())
        .build()
        .unwrap();

    service.check_rate_limit("/a", "c1").await.unwrap();
    service.check_rate_limit("/a", "c1").await.unwrap();
    // Same algorithm, so "/b" shares the client's window with "/a".
    service.check_rate_limit("/b", "c1").await.unwrap();

    assert_eq!(metrics.successes("/a", "c1"), 1);
    assert_eq!(metrics.exceeded("/a", "c1"), 1);
    assert_eq!(metrics.exceeded("/b", "c1"), 1);
}

#[tokio::test(start_paused = true)]
async fn sweeper_evicts_idle_clients() {
    let clock = ManualClock::new(10_000);
    let service = RateLimitService::builder(RateLimitConfig {
        client_inactivity_millis: 1_000,
        ..config(ThrottlingStrategyType::Delay)
    })
    .clock(clock.clone())
    .sleeper(TrackingSleeper::new())
    .build()
    .unwrap();

    service.check_rate_limit("/a", "c1").await.unwrap();
    service.check_rate_limit("/a", "c2").await.unwrap();
    assert_eq!(service.tracked_clients(), 2);

    let sweeper = service.spawn_sweeper(Duration::from_secs(60));
    clock.advance(Duration::from_secs(5));
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(service.tracked_clients(), 0);

    drop(service);
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert!(sweeper.is_finished());
}

#[tokio::test]
async fn denials_are_logged_with_request_context() {
    let buffer = LogBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let service = RateLimitService::builder(config(ThrottlingStrategyType::Delay))
        .clock(ManualClock::new(10_000))
        .sleeper(TrackingSleeper::new())
        .build()
        .unwrap();
    service.check_rate_limit("/orders", "acme").await.unwrap();
    service.check_rate_limit("/orders", "acme").await.unwrap();

    let logs = buffer.contents();
    assert!(logs.contains("Rate limit exceeded"), "logs: {logs}");
    assert!(logs.contains("client_id=\"acme\""), "logs: {logs}");
    assert!(logs.contains("retry_after_ms=1000"), "logs: {logs}");
}

/// Repository that yields before every access, like one doing real I/O.
#[derive(Debug)]
struct YieldingRepository(InMemoryRateLimitRepository);

#[async_trait]
impl RateLimitRepository for YieldingRepository {
    async fn get(&self, client_id: &str, endpoint: &str) -> RateLimit {
        tokio::task::yield_now().await;
        self.0.get(client_id, endpoint).await
    }

    async fn save(&self, client_id: &str, endpoint: &str, rate_limit: RateLimit) {
        tokio::task::yield_now().await;
        self.0.save(client_id, endpoint, rate_limit).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_quota_requests_stay_within_budget() {
    let clock = ManualClock::new(10_000);
    let store = InMemoryRateLimitRepository::new(Arc::new(clock.clone()));
    let service = Arc::new(
        RateLimitService::builder(RateLimitConfig {
            default_algorithm: AlgorithmType::Quota,
            default_throttling_strategy: ThrottlingStrategyType::Reject,
            quota_limit: 5,
            circuit_breaker_failure_threshold: 1_000_000,
            ..RateLimitConfig::default()
        })
        .clock(clock)
        .repository(Arc::new(YieldingRepository(store.clone())))
        .build()
        .unwrap(),
    );

    let requests: Vec<_> = (0..40)
        .map(|_| {
            let service = service.clone();
            tokio::spawn(async move { service.check_rate_limit("/q", "c1").await })
        })
        .collect();

    let mut admitted = 0;
    for outcome in futures::future::join_all(requests).await {
        match outcome.expect("request panicked") {
            Ok(result) => {
                assert!(result.is_allowed());
                admitted += 1;
            }
            Err(err) => assert!(err.is_rejected(), "unexpected error: {err}"),
        }
    }
    assert_eq!(admitted, 5);

    let stored = store.get("c1", "/q").await;
    assert_eq!(stored.quota_used(), 5);
    assert_eq!(stored.request_count(), 5);
}

#[tokio::test]
async fn monotonic_clock_drives_an_in_process_service() {
    // Records live only in memory, so a clock immune to wall-clock steps is enough.
    let service = RateLimitService::builder(config(ThrottlingStrategyType::Reject))
        .clock(MonotonicClock::default())
        .build()
        .unwrap();

    assert!(service.check_rate_limit("/a", "c1").await.unwrap().is_allowed());
    let err = service.check_rate_limit("/a", "c1").await.unwrap_err();
    assert!(err.is_rejected());
    assert!(err.retry_after().is_some_and(|retry| retry <= Duration::from_secs(1)));
}
