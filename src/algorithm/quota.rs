//! Quota: a budget of admissions per reset period, carried in the `RateLimit` value itself.

use super::{denied_after, Estimate, RateLimitAlgorithm};
use crate::domain::{Admission, AlgorithmType, RateLimit, RateLimitResult};
use std::time::Duration;

/// Quota period: one day.
pub const QUOTA_RESET_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug)]
pub struct Quota {
    limit: u64,
    period_millis: u64,
}

impl Quota {
    pub fn new(limit: u64) -> Self {
        Self::with_period(limit, QUOTA_RESET_PERIOD)
    }

    pub fn with_period(limit: u64, period: Duration) -> Self {
        let period_millis = u64::try_from(period.as_millis()).unwrap_or(u64::MAX).max(1);
        Self { limit, period_millis }
    }

    fn period_elapsed(&self, rate_limit: &RateLimit, now: u64) -> bool {
        now.saturating_sub(rate_limit.last_reset_time()) >= self.period_millis
    }
}

impl RateLimitAlgorithm for Quota {
    fn kind(&self) -> AlgorithmType {
        AlgorithmType::Quota
    }

    fn decide(&self, rate_limit: &RateLimit, now: u64) -> Admission {
        let client_id = rate_limit.client().id();
        let current = if self.period_elapsed(rate_limit, now) {
            tracing::info!(client_id, "Quota reset");
            rate_limit.reset_quota_used(now)
        } else {
            rate_limit.clone()
        };

        if current.quota_used() >= self.limit {
            let next_reset = current.last_reset_time().saturating_add(self.period_millis);
            let retry = next_reset.saturating_sub(now);
            tracing::debug!(client_id, quota_used = current.quota_used(), retry_after_ms = retry, "Quota exceeded");
            return Admission::new(denied_after(retry), current);
        }

        let updated = current.increment_quota_used();
        tracing::trace!(client_id, quota_used = updated.quota_used(), "Quota admitted");
        Admission::new(RateLimitResult::allowed(), updated)
    }

    fn decide_optimistic(&self, rate_limit: &RateLimit, now: u64) -> Estimate {
        // Only denials are final here; an admission must be serialized with the save.
        if self.period_elapsed(rate_limit, now) || rate_limit.quota_used() < self.limit {
            return Estimate::Undecided;
        }
        Estimate::Decided(self.decide(rate_limit, now))
    }

    fn evict(&self, _client_id: &str) {}

    fn tracked_clients(&self) -> usize {
        0
    }
}
