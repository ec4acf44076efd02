//! Per-endpoint algorithm selection.
//!
//! [`RateLimitContext`] answers "which limiter decides for this endpoint" and short-circuits
//! exempt clients. Limiters are built on first use from the configuration of the check that
//! needed them and cached by algorithm type, so two endpoints using the same algorithm share
//! per-client state. The cache is dropped whenever the configuration changes.

use crate::algorithm::{build_rate_limiter, RateLimiter};
use crate::circuit_breaker::RateLimitCircuitBreaker;
use crate::clock::Clock;
use crate::config::RateLimitConfig;
use crate::domain::{Admission, AlgorithmType, RateLimit, RateLimitResult};
use crate::dynamic_config::{ConfigListener, ConfigUpdate};
use crate::error::Result;
use crate::guard::IdleSweep;
use crate::ports::ExemptionCheck;
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Debug)]
pub struct RateLimitContext {
    exemptions: Arc<dyn ExemptionCheck>,
    breaker: Arc<RateLimitCircuitBreaker>,
    clock: Arc<dyn Clock>,
    limiters: DashMap<AlgorithmType, Arc<dyn RateLimiter>>,
}

impl RateLimitContext {
    pub fn new(
        exemptions: Arc<dyn ExemptionCheck>,
        breaker: Arc<RateLimitCircuitBreaker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { exemptions, breaker, clock, limiters: DashMap::new() }
    }

    /// Decide for `rate_limit` on `endpoint` under `config`.
    pub fn check(&self, endpoint: &str, rate_limit: &RateLimit, config: &RateLimitConfig) -> Result<Admission> {
        if self.exemptions.is_exempt(rate_limit.client()) {
            tracing::debug!(endpoint, client_id = rate_limit.client().id(), "Client is exempt");
            return Ok(Admission::new(RateLimitResult::allowed(), rate_limit.clone()));
        }
        let limiter = self.limiter_for(config.algorithm_for(endpoint), config)?;
        limiter.check(rate_limit)
    }

    pub fn check_rate_limit(
        &self,
        endpoint: &str,
        rate_limit: &RateLimit,
        config: &RateLimitConfig,
    ) -> Result<RateLimitResult> {
        self.check(endpoint, rate_limit, config).map(|admission| admission.result)
    }

    /// Cached limiter for `kind`, building it from `config` on a miss.
    pub fn limiter_for(&self, kind: AlgorithmType, config: &RateLimitConfig) -> Result<Arc<dyn RateLimiter>> {
        if let Some(limiter) = self.limiters.get(&kind) {
            return Ok(limiter.clone());
        }
        let limiter = self
            .limiters
            .entry(kind)
            .or_try_insert_with(|| build_rate_limiter(kind, config, self.breaker.clone(), self.clock.clone()))?
            .clone();
        Ok(limiter)
    }

    /// Drop every cached limiter together with its per-client state.
    pub fn invalidate(&self) {
        self.limiters.clear();
    }

    pub fn cached_algorithms(&self) -> usize {
        self.limiters.len()
    }

    /// Clients with live state, summed over every cached limiter.
    pub fn tracked_clients(&self) -> usize {
        self.limiters.iter().map(|limiter| limiter.tracked_clients()).sum()
    }
}

impl ConfigListener for RateLimitContext {
    fn config_updated(&self, update: &ConfigUpdate) {
        let dropped = self.cached_algorithms();
        self.invalidate();
        tracing::debug!(version = update.new.version, dropped, "Algorithm cache invalidated");
    }
}

impl IdleSweep for RateLimitContext {
    fn sweep_idle(&self) -> usize {
        // Collect first so no shard lock is held while limiters sweep.
        let limiters: Vec<_> = self.limiters.iter().map(|limiter| limiter.clone()).collect();
        limiters.iter().map(|limiter| limiter.sweep_idle()).sum()
    }
}
