//! Token bucket: each admission spends a token; tokens accrue at the policy rate per window.

use super::{denied_after, Estimate, RateLimitAlgorithm};
use crate::domain::{Admission, AlgorithmType, RateLimit, RateLimitResult};
use crate::state::TokenBucketState;
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Debug)]
pub struct TokenBucket {
    capacity: u64,
    window_millis: u64,
    buckets: DashMap<String, Arc<TokenBucketState>>,
}

impl TokenBucket {
    /// New buckets start with `capacity` tokens.
    pub fn new(capacity: u64, window_millis: u64) -> Self {
        Self { capacity, window_millis: window_millis.max(1), buckets: DashMap::new() }
    }
}

impl RateLimitAlgorithm for TokenBucket {
    fn kind(&self) -> AlgorithmType {
        AlgorithmType::TokenBucket
    }

    fn decide(&self, rate_limit: &RateLimit, now: u64) -> Admission {
        let Some(rate) = rate_limit.policy().requests_per_second() else {
            return Admission::new(RateLimitResult::allowed(), rate_limit.clone());
        };
        let client_id = rate_limit.client().id();
        let capacity = self.capacity;
        let bucket = self
            .buckets
            .entry(client_id.to_string())
            .or_insert_with(|| Arc::new(TokenBucketState::new(capacity, now)))
            .clone();

        bucket.refill(now, rate, self.window_millis);
        let result = if bucket.try_consume() {
            tracing::trace!(client_id, tokens_left = bucket.tokens(), "Token granted");
            RateLimitResult::allowed()
        } else {
            let retry = bucket.time_to_next_token(now, rate, self.window_millis);
            tracing::debug!(client_id, retry_after_ms = retry, "Token bucket empty");
            denied_after(retry)
        };
        Admission::new(result, rate_limit.clone())
    }

    fn decide_optimistic(&self, rate_limit: &RateLimit, now: u64) -> Estimate {
        let Some(rate) = rate_limit.policy().requests_per_second() else {
            return Estimate::Undecided;
        };
        let Some(bucket) = self.buckets.get(rate_limit.client().id()).map(|b| b.clone()) else {
            return Estimate::Undecided;
        };
        if bucket.peek(now, rate, self.window_millis) > 0 {
            return Estimate::Undecided;
        }
        let retry = bucket.time_to_next_token(now, rate, self.window_millis);
        Estimate::Decided(Admission::new(denied_after(retry), rate_limit.clone()))
    }

    fn evict(&self, client_id: &str) {
        self.buckets.remove(client_id);
    }

    fn tracked_clients(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Client, ClientType, Policy};
    use std::time::Duration;

    fn rate_limit(rps: u32) -> RateLimit {
        RateLimit::new(Client::new("c1", ClientType::Vip), Policy::limited(rps).unwrap(), 0)
    }

    #[test]
    fn exhausting_then_waiting_one_window_restores_admission() {
        let algo = TokenBucket::new(10, 1_000);
        let rl = rate_limit(10);
        for _ in 0..10 {
            assert!(algo.decide(&rl, 0).is_allowed());
        }
        let denied = algo.decide(&rl, 0);
        assert!(!denied.is_allowed());
        assert_eq!(denied.result.retry_after(), Duration::from_millis(100));

        for _ in 0..10 {
            assert!(algo.decide(&rl, 1_000).is_allowed());
        }
        assert!(!algo.decide(&rl, 1_000).is_allowed());
    }

    #[test]
    fn denial_leaves_tokens_at_zero() {
        let algo = TokenBucket::new(1, 1_000);
        let rl = rate_limit(1);
        algo.decide(&rl, 0);
        algo.decide(&rl, 10);
        algo.decide(&rl, 20);
        assert_eq!(algo.buckets.get("c1").unwrap().tokens(), 0);
    }

    #[test]
    fn optimistic_denies_empty_bucket_only() {
        let algo = TokenBucket::new(1, 1_000);
        let rl = rate_limit(2);
        assert_eq!(algo.decide_optimistic(&rl, 0), Estimate::Undecided);
        algo.decide(&rl, 0);
        assert!(matches!(algo.decide_optimistic(&rl, 100), Estimate::Decided(a) if !a.is_allowed()));
        // Half a window later a token has accrued.
        assert_eq!(algo.decide_optimistic(&rl, 500), Estimate::Undecided);
    }
}
