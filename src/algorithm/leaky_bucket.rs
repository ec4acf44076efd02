//! Leaky bucket: each admission adds a unit of water; the bucket leaks at the policy rate.

use super::{denied_after, Estimate, RateLimitAlgorithm};
use crate::domain::{Admission, AlgorithmType, RateLimit, RateLimitResult};
use crate::state::LeakyBucketState;
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Debug)]
pub struct LeakyBucket {
    capacity: u64,
    buckets: DashMap<String, Arc<LeakyBucketState>>,
}

impl LeakyBucket {
    pub fn new(capacity: u64) -> Self {
        Self { capacity, buckets: DashMap::new() }
    }
}

impl RateLimitAlgorithm for LeakyBucket {
    fn kind(&self) -> AlgorithmType {
        AlgorithmType::LeakyBucket
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
            .or_insert_with(|| Arc::new(LeakyBucketState::new(capacity, now)))
            .clone();

        let level = bucket.drain(now, rate);
        let result = if bucket.try_fill() {
            tracing::trace!(client_id, level = level + 1, "Leaky bucket admitted");
            RateLimitResult::allowed()
        } else {
            let retry = bucket.retry_after_millis(level, rate);
            tracing::debug!(client_id, level, retry_after_ms = retry, "Leaky bucket full");
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
        let level = bucket.projected_level(now, rate);
        if level < bucket.capacity() {
            return Estimate::Undecided;
        }
        Estimate::Decided(Admission::new(
            denied_after(bucket.retry_after_millis(level, rate)),
            rate_limit.clone(),
        ))
    }

    fn evict(&self, client_id: &str) {
        self.buckets.remove(client_id);
    }

    fn tracked_clients(&self) -> usize {
        self.buckets.len()
    }
}
