//! Fixed window: at most `limit` admissions per window, counter reset at rollover.

use super::{denied_after, limit_of, Estimate, RateLimitAlgorithm};
use crate::domain::{Admission, AlgorithmType, RateLimit, RateLimitResult};
use crate::state::WindowCounter;
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Debug)]
pub struct FixedWindow {
    window_millis: u64,
    counters: DashMap<String, Arc<WindowCounter>>,
}

impl FixedWindow {
    pub fn new(window_millis: u64) -> Self {
        Self { window_millis: window_millis.max(1), counters: DashMap::new() }
    }

    fn counter(&self, client_id: &str, now: u64) -> Arc<WindowCounter> {
        if let Some(counter) = self.counters.get(client_id) {
            return counter.clone();
        }
        self.counters
            .entry(client_id.to_string())
            .or_insert_with(|| Arc::new(WindowCounter::new(now)))
            .clone()
    }

    fn remaining_window(&self, now: u64, window_start: u64) -> u64 {
        self.window_millis.saturating_sub(now.saturating_sub(window_start))
    }
}

impl RateLimitAlgorithm for FixedWindow {
    fn kind(&self) -> AlgorithmType {
        AlgorithmType::FixedWindow
    }

    fn decide(&self, rate_limit: &RateLimit, now: u64) -> Admission {
        let Some(limit) = limit_of(rate_limit) else {
            return Admission::new(RateLimitResult::allowed(), rate_limit.clone());
        };
        let client_id = rate_limit.client().id();
        let counter = self.counter(client_id, now);
        let window_start = counter.window_start();

        if now.saturating_sub(window_start) >= self.window_millis {
            if counter.try_roll(window_start, now, 1) {
                tracing::debug!(client_id, window_start = now, "Fixed window reset");
            }
            // The request that observes the rollover is admitted whoever won it.
            return Admission::new(RateLimitResult::allowed(), rate_limit.clone());
        }

        let count = counter.increment_and_get();
        let result = if count <= limit {
            tracing::trace!(client_id, count, "Fixed window admitted");
            RateLimitResult::allowed()
        } else {
            counter.decrement();
            let retry = self.remaining_window(now, window_start);
            tracing::debug!(client_id, count = count - 1, retry_after_ms = retry, "Fixed window exceeded");
            denied_after(retry)
        };
        Admission::new(result, rate_limit.clone())
    }

    fn decide_optimistic(&self, rate_limit: &RateLimit, now: u64) -> Estimate {
        let Some(limit) = limit_of(rate_limit) else {
            return Estimate::Undecided;
        };
        let Some(counter) = self.counters.get(rate_limit.client().id()).map(|c| c.clone()) else {
            return Estimate::Undecided;
        };
        let window_start = counter.window_start();
        if now.saturating_sub(window_start) >= self.window_millis || counter.count() < limit {
            return Estimate::Undecided;
        }
        let retry = self.remaining_window(now, window_start);
        Estimate::Decided(Admission::new(denied_after(retry), rate_limit.clone()))
    }

    fn evict(&self, client_id: &str) {
        self.counters.remove(client_id);
    }

    fn tracked_clients(&self) -> usize {
        self.counters.len()
    }
}
