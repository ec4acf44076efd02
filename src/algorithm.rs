//! Rate-limiting algorithms.
//!
//! An algorithm only knows how to decide for one client given the current time. Locking,
//! circuit-breaker checks and idle eviction live in [`ConcurrencyGuard`], which wraps every
//! algorithm and exposes it as an object-safe [`RateLimiter`].
//!
//! Per-client state is keyed by client id and shared by every endpoint that selects the same
//! algorithm type.

use crate::circuit_breaker::RateLimitCircuitBreaker;
use crate::clock::Clock;
use crate::config::RateLimitConfig;
use crate::domain::{Admission, AlgorithmType, RateLimit, RateLimitResult};
use crate::error::Result;
use crate::guard::{ConcurrencyGuard, IdleSweep, LockPolicy};
use std::sync::Arc;
use std::time::Duration;

pub mod fixed_window;
pub mod leaky_bucket;
pub mod quota;
pub mod sliding_window;
pub mod token_bucket;

pub use fixed_window::FixedWindow;
pub use leaky_bucket::LeakyBucket;
pub use quota::Quota;
pub use sliding_window::SlidingWindow;
pub use token_bucket::TokenBucket;

/// Result of a lock-free estimate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Estimate {
    /// The estimate is final, provided no writer touched the client meanwhile.
    Decided(Admission),
    /// Admitting would require mutating per-client state; take the write path.
    Undecided,
}

/// Decision logic for one algorithm.
///
/// `decide` runs under the client's exclusive lock and may mutate per-client state.
/// `decide_optimistic` must not mutate anything; it runs concurrently with writers and its
/// result is discarded if a writer interleaved.
pub trait RateLimitAlgorithm: Send + Sync + std::fmt::Debug + 'static {
    fn kind(&self) -> AlgorithmType;

    /// Authoritative decision at `now`.
    fn decide(&self, rate_limit: &RateLimit, now: u64) -> Admission;

    /// Side-effect-free estimate at `now`.
    fn decide_optimistic(&self, rate_limit: &RateLimit, now: u64) -> Estimate;

    /// Drop any state held for `client_id`.
    fn evict(&self, client_id: &str);

    /// Number of clients with live state.
    fn tracked_clients(&self) -> usize;
}

/// Object-safe facade over a guarded algorithm.
pub trait RateLimiter: IdleSweep + std::fmt::Debug {
    fn algorithm_type(&self) -> AlgorithmType;

    /// Decide for `rate_limit` and return the value the caller should persist.
    fn check(&self, rate_limit: &RateLimit) -> Result<Admission>;

    fn check_rate_limit(&self, rate_limit: &RateLimit) -> Result<RateLimitResult> {
        self.check(rate_limit).map(|admission| admission.result)
    }

    fn tracked_clients(&self) -> usize;
}

/// Per-second limit of a policy; `None` means unrestricted.
pub(crate) fn limit_of(rate_limit: &RateLimit) -> Option<u64> {
    rate_limit.policy().requests_per_second().map(u64::from)
}

pub(crate) fn denied_after(millis: u64) -> RateLimitResult {
    RateLimitResult::denied(Duration::from_millis(millis))
}

/// Build the guarded limiter for `kind` from a configuration.
pub fn build_rate_limiter(
    kind: AlgorithmType,
    config: &RateLimitConfig,
    breaker: Arc<RateLimitCircuitBreaker>,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn RateLimiter>> {
    let lock_policy = config.lock_policy()?;
    let inactivity = Duration::from_millis(config.client_inactivity_millis);

    fn guarded<A: RateLimitAlgorithm>(
        algorithm: A,
        breaker: Arc<RateLimitCircuitBreaker>,
        clock: Arc<dyn Clock>,
        lock_policy: LockPolicy,
        inactivity: Duration,
    ) -> Arc<dyn RateLimiter> {
        Arc::new(
            ConcurrencyGuard::new(algorithm, breaker, clock)
                .with_lock_policy(lock_policy)
                .with_inactivity_threshold(inactivity),
        )
    }

    tracing::info!(algorithm = %kind, "Creating rate limit algorithm instance");
    let limiter = match kind {
        AlgorithmType::FixedWindow => guarded(
            FixedWindow::new(config.time_window_millis),
            breaker,
            clock,
            lock_policy,
            inactivity,
        ),
        AlgorithmType::SlidingWindow => guarded(
            SlidingWindow::new(config.sliding_window_size),
            breaker,
            clock,
            lock_policy,
            inactivity,
        ),
        AlgorithmType::TokenBucket => guarded(
            TokenBucket::new(config.bucket_capacity, config.time_window_millis),
            breaker,
            clock,
            lock_policy,
            inactivity,
        ),
        AlgorithmType::LeakyBucket => {
            guarded(LeakyBucket::new(config.bucket_capacity), breaker, clock, lock_policy, inactivity)
        }
        AlgorithmType::Quota => {
            guarded(Quota::new(config.quota_limit), breaker, clock, lock_policy, inactivity)
        }
    };
    Ok(limiter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn factory_builds_every_algorithm_type() {
        let config = RateLimitConfig::default();
        let breaker = Arc::new(RateLimitCircuitBreaker::new(5, Duration::from_secs(1)).unwrap());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        for kind in AlgorithmType::ALL {
            let limiter = build_rate_limiter(kind, &config, breaker.clone(), clock.clone()).unwrap();
            assert_eq!(limiter.algorithm_type(), kind);
            assert_eq!(limiter.tracked_clients(), 0);
        }
    }

    #[test]
    fn factory_rejects_zero_lock_retries() {
        let config = RateLimitConfig { lock_retries: 0, ..RateLimitConfig::default() };
        let breaker = Arc::new(RateLimitCircuitBreaker::new(5, Duration::from_secs(1)).unwrap());
        let err = build_rate_limiter(AlgorithmType::Quota, &config, breaker, Arc::new(ManualClock::new(0)))
            .unwrap_err();
        assert!(err.is_validation());
    }
}
