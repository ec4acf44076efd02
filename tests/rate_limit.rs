mod common;

use common::{limiter, rate_limit};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use turnstile::algorithm::quota::QUOTA_RESET_PERIOD;
use turnstile::clock::ManualClock;
use turnstile::{
    build_rate_limiter, AlgorithmType, CircuitState, RateLimitCircuitBreaker, RateLimitConfig,
};

#[test]
fn fixed_window_admits_limit_then_resets() {
    let clock = ManualClock::new(10_000);
    let limiter = limiter(AlgorithmType::FixedWindow, &RateLimitConfig::default(), &clock);
    let value = rate_limit("c1", 5);

    for _ in 0..5 {
        assert!(limiter.check_rate_limit(&value).unwrap().is_allowed());
    }
    let denied = limiter.check_rate_limit(&value).unwrap();
    assert!(!denied.is_allowed());
    assert!(denied.retry_after() <= Duration::from_secs(1));

    clock.advance(Duration::from_millis(1_000));
    assert!(limiter.check_rate_limit(&value).unwrap().is_allowed());
}

#[test]
fn sliding_window_forgets_requests_older_than_the_window() {
    let clock = ManualClock::new(10_000);
    let limiter = limiter(AlgorithmType::SlidingWindow, &RateLimitConfig::default(), &clock);
    let value = rate_limit("c1", 3);

    for _ in 0..3 {
        assert!(limiter.check_rate_limit(&value).unwrap().is_allowed());
    }
    clock.set(10_500);
    assert!(!limiter.check_rate_limit(&value).unwrap().is_allowed());
    clock.set(11_100);
    assert!(limiter.check_rate_limit(&value).unwrap().is_allowed());
}

#[test]
fn token_bucket_refills_after_one_window() {
    let clock = ManualClock::new(10_000);
    let config = RateLimitConfig { bucket_capacity: 10, time_window_millis: 1_000, ..RateLimitConfig::default() };
    let limiter = limiter(AlgorithmType::TokenBucket, &config, &clock);
    let value = rate_limit("c1", 10);

    for _ in 0..10 {
        assert!(limiter.check_rate_limit(&value).unwrap().is_allowed());
    }
    let denied = limiter.check_rate_limit(&value).unwrap();
    assert!(!denied.is_allowed());
    assert_eq!(denied.retry_after(), Duration::from_millis(100));

    clock.advance(Duration::from_millis(1_000));
    for _ in 0..10 {
        assert!(limiter.check_rate_limit(&value).unwrap().is_allowed());
    }
}

#[test]
fn leaky_bucket_readmits_after_draining() {
    let clock = ManualClock::new(10_000);
    let config = RateLimitConfig { bucket_capacity: 5, ..RateLimitConfig::default() };
    let limiter = limiter(AlgorithmType::LeakyBucket, &config, &clock);
    let value = rate_limit("c1", 5);

    for _ in 0..5 {
        assert!(limiter.check_rate_limit(&value).unwrap().is_allowed());
    }
    assert!(!limiter.check_rate_limit(&value).unwrap().is_allowed());

    clock.advance(Duration::from_millis(1_000));
    assert!(limiter.check_rate_limit(&value).unwrap().is_allowed());
}

#[test]
fn quota_denies_past_budget_until_the_period_resets() {
    let day = QUOTA_RESET_PERIOD.as_millis() as u64;
    let clock = ManualClock::new(1_000);
    let config = RateLimitConfig { quota_limit: 100, ..RateLimitConfig::default() };
    let limiter = limiter(AlgorithmType::Quota, &config, &clock);

    let mut value = rate_limit("c1", 10);
    for _ in 0..100 {
        let admission = limiter.check(&value).unwrap();
        assert!(admission.is_allowed());
        value = admission.rate_limit;
    }
    let denied = limiter.check(&value).unwrap();
    assert!(!denied.is_allowed());
    assert_eq!(denied.result.retry_after(), Duration::from_millis(day - 1_000));
    assert_eq!(denied.rate_limit.quota_used(), 100);

    clock.set(day);
    let admission = limiter.check(&value).unwrap();
    assert!(admission.is_allowed());
    assert_eq!(admission.rate_limit.quota_used(), 1);
    assert_eq!(admission.rate_limit.last_reset_time(), day);
}

#[test]
fn denials_leave_state_unchanged() {
    let clock = ManualClock::new(10_000);
    let limiter = limiter(AlgorithmType::FixedWindow, &RateLimitConfig::default(), &clock);
    let value = rate_limit("c1", 2);

    limiter.check_rate_limit(&value).unwrap();
    limiter.check_rate_limit(&value).unwrap();
    let first = limiter.check_rate_limit(&value).unwrap();
    for _ in 0..20 {
        assert_eq!(limiter.check_rate_limit(&value).unwrap(), first);
    }
    clock.advance(Duration::from_millis(1_000));
    assert!(limiter.check_rate_limit(&value).unwrap().is_allowed());
    assert!(limiter.check_rate_limit(&value).unwrap().is_allowed());
}

#[test]
fn distinct_clients_are_independent() {
    let clock = ManualClock::new(10_000);
    let limiter = limiter(AlgorithmType::SlidingWindow, &RateLimitConfig::default(), &clock);

    assert!(limiter.check_rate_limit(&rate_limit("a", 1)).unwrap().is_allowed());
    assert!(!limiter.check_rate_limit(&rate_limit("a", 1)).unwrap().is_allowed());
    assert!(limiter.check_rate_limit(&rate_limit("b", 1)).unwrap().is_allowed());
}

#[test]
fn open_breaker_denies_with_reset_timeout() {
    let clock = ManualClock::new(10_000);
    let breaker = Arc::new(
        RateLimitCircuitBreaker::new(2, Duration::from_secs(30)).unwrap().with_clock(clock.clone()),
    );
    let limiter = build_rate_limiter(
        AlgorithmType::FixedWindow,
        &RateLimitConfig::default(),
        breaker.clone(),
        Arc::new(clock.clone()),
    )
    .unwrap();
    let value = rate_limit("c1", 1);

    limiter.check_rate_limit(&value).unwrap();
    limiter.check_rate_limit(&value).unwrap();
    limiter.check_rate_limit(&value).unwrap();
    assert_eq!(breaker.failure_count(), 2);

    // The open transition is evaluated on the next check.
    let denied = limiter.check_rate_limit(&rate_limit("other", 100)).unwrap();
    assert!(!denied.is_allowed());
    assert_eq!(denied.retry_after(), Duration::from_secs(30));
    assert_eq!(breaker.state(), CircuitState::Open);

    clock.advance(Duration::from_secs(30));
    assert!(limiter.check_rate_limit(&rate_limit("other", 100)).unwrap().is_allowed());
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[test]
fn concurrent_checks_never_over_admit() {
    let clock = ManualClock::new(10_000);
    for kind in [
        AlgorithmType::FixedWindow,
        AlgorithmType::SlidingWindow,
        AlgorithmType::TokenBucket,
        AlgorithmType::LeakyBucket,
    ] {
        let config = RateLimitConfig { bucket_capacity: 25, ..RateLimitConfig::default() };
        let limiter = limiter(kind, &config, &clock);
        let admitted = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                let admitted = admitted.clone();
                std::thread::spawn(move || {
                    let value = rate_limit("shared", 25);
                    for _ in 0..50 {
                        if limiter.check_rate_limit(&value).unwrap().is_allowed() {
                            admitted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("worker panicked");
        }
        assert_eq!(admitted.load(Ordering::SeqCst), 25, "{kind} over- or under-admitted");
    }
}

#[test]
fn invalid_input_is_rejected_before_any_state_is_touched() {
    let clock = ManualClock::new(10_000);
    let limiter = limiter(AlgorithmType::FixedWindow, &RateLimitConfig::default(), &clock);
    let err = limiter.check_rate_limit(&rate_limit("", 5)).unwrap_err();
    assert!(err.is_validation());
    assert_eq!(limiter.tracked_clients(), 0);
}
