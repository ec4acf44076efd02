use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use std::time::Duration;
use turnstile::clock::ManualClock;
use turnstile::{
    build_rate_limiter, AlgorithmType, Client, ClientType, Policy, RateLimit, RateLimitCircuitBreaker,
    RateLimitConfig, RateLimitService, ThrottlingStrategyType, InstantSleeper,
};

fn breaker() -> Arc<RateLimitCircuitBreaker> {
    Arc::new(RateLimitCircuitBreaker::new(u32::MAX, Duration::from_secs(30)).unwrap())
}

fn value(rps: u32) -> RateLimit {
    RateLimit::new(Client::new("bench", ClientType::Standard), Policy::limited(rps).unwrap(), 0)
}

// Every check lands in one window and is admitted, so each goes through the write lock.
fn admitted_check(c: &mut Criterion) {
    let clock = ManualClock::new(10_000);
    let limiter = build_rate_limiter(
        AlgorithmType::FixedWindow,
        &RateLimitConfig::default(),
        breaker(),
        Arc::new(clock.clone()),
    )
    .unwrap();
    let value = value(u32::MAX);

    c.bench_function("fixed_window_admitted", |b| {
        b.iter(|| black_box(limiter.check_rate_limit(black_box(&value)).unwrap()));
    });
}

// Once exhausted, denials are answered by the lock-free optimistic path.
fn denied_check(c: &mut Criterion) {
    for kind in [AlgorithmType::FixedWindow, AlgorithmType::TokenBucket, AlgorithmType::LeakyBucket] {
        let clock = ManualClock::new(10_000);
        let limiter =
            build_rate_limiter(kind, &RateLimitConfig::default(), breaker(), Arc::new(clock.clone())).unwrap();
        let value = value(1);
        while limiter.check_rate_limit(&value).unwrap().is_allowed() {}

        c.bench_function(&format!("{kind}_denied_optimistic"), |b| {
            b.iter(|| black_box(limiter.check_rate_limit(black_box(&value)).unwrap()));
        });
    }
}

fn service_check(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let config = RateLimitConfig {
        default_algorithm: AlgorithmType::TokenBucket,
        default_throttling_strategy: ThrottlingStrategyType::Delay,
        circuit_breaker_failure_threshold: u32::MAX,
        ..RateLimitConfig::default()
    };
    let service = RateLimitService::builder(config)
        .clock(ManualClock::new(10_000))
        .sleeper(InstantSleeper)
        .build()
        .unwrap();

    c.bench_function("service_check_rate_limit", |b| {
        b.to_async(&rt).iter(|| async {
            let _ = black_box(service.check_rate_limit(black_box("/orders"), black_box("bench")).await);
        });
    });
}

criterion_group!(benches, admitted_check, denied_check, service_check);
criterion_main!(benches);
