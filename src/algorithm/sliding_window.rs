//! Sliding window: at most `limit` admissions in any trailing window.

use super::{denied_after, limit_of, Estimate, RateLimitAlgorithm};
use crate::domain::{Admission, AlgorithmType, RateLimit, RateLimitResult};
use crate::state::TimestampQueue;
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Debug)]
pub struct SlidingWindow {
    window_millis: u64,
    queues: DashMap<String, Arc<TimestampQueue>>,
}

impl SlidingWindow {
    pub fn new(window_millis: u64) -> Self {
        Self { window_millis: window_millis.max(1), queues: DashMap::new() }
    }

    /// Timestamps at or before this instant have left the window.
    fn cutoff(&self, now: u64) -> Option<u64> {
        now.checked_sub(self.window_millis)
    }

    fn retry_after(&self, now: u64, oldest: Option<u64>) -> u64 {
        oldest.map_or(1, |oldest| self.window_millis.saturating_sub(now.saturating_sub(oldest)))
    }
}

impl RateLimitAlgorithm for SlidingWindow {
    fn kind(&self) -> AlgorithmType {
        AlgorithmType::SlidingWindow
    }

    fn decide(&self, rate_limit: &RateLimit, now: u64) -> Admission {
        let Some(limit) = limit_of(rate_limit) else {
            return Admission::new(RateLimitResult::allowed(), rate_limit.clone());
        };
        let client_id = rate_limit.client().id();
        let queue = self.queues.entry(client_id.to_string()).or_default().clone();

        if let Some(cutoff) = self.cutoff(now) {
            let evicted = queue.evict_expired(cutoff);
            if evicted > 0 {
                tracing::trace!(client_id, evicted, "Dropped expired timestamps");
            }
        }

        let result = if (queue.len() as u64) < limit {
            queue.push(now);
            tracing::trace!(client_id, in_window = queue.len(), "Sliding window admitted");
            RateLimitResult::allowed()
        } else {
            let retry = self.retry_after(now, queue.oldest());
            tracing::debug!(client_id, retry_after_ms = retry, "Sliding window exceeded");
            denied_after(retry)
        };
        Admission::new(result, rate_limit.clone())
    }

    fn decide_optimistic(&self, rate_limit: &RateLimit, now: u64) -> Estimate {
        let Some(limit) = limit_of(rate_limit) else {
            return Estimate::Undecided;
        };
        let Some(queue) = self.queues.get(rate_limit.client().id()).map(|q| q.clone()) else {
            return Estimate::Undecided;
        };
        let (live, oldest) = match self.cutoff(now) {
            Some(cutoff) => queue.live_after(cutoff),
            None => (queue.len(), queue.oldest()),
        };
        if (live as u64) < limit {
            return Estimate::Undecided;
        }
        Estimate::Decided(Admission::new(denied_after(self.retry_after(now, oldest)), rate_limit.clone()))
    }

    fn evict(&self, client_id: &str) {
        self.queues.remove(client_id);
    }

    fn tracked_clients(&self) -> usize {
        self.queues.len()
    }
}
