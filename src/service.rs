//! Request-level orchestration.
//!
//! [`RateLimitService::check_rate_limit`] runs one request through the engine:
//!
//! 1. identify the client and resolve the current time range
//! 2. take the record lock for `(client, endpoint)` and load the stored [`RateLimit`]
//! 3. under the configuration read gate: resolve the policy, decide, pick the throttling strategy
//! 4. persist the admitted value and release the record lock
//! 5. record the outcome and throttle denied requests
//!
//! Steps 2 to 4 run under one async mutex per record, so concurrent requests for the same record
//! never decide from the same stored value. Step 3 is synchronous and holds the configuration
//! gate across no `.await`.

use crate::circuit_breaker::RateLimitCircuitBreaker;
use crate::clock::{Clock, SystemClock};
use crate::config::RateLimitConfig;
use crate::context::RateLimitContext;
use crate::domain::{Admission, Client, RateLimit, RateLimitResult};
use crate::dynamic_config::{ConfigCoordinator, ConfigSnapshot, ConfigUpdate};
use crate::error::{RateLimitError, Result};
use crate::guard::spawn_sweeper;
use crate::ports::{
    ClientIdentification, ConfigPolicyResolver, DefaultTimeRange, ExemptionCheck, InMemoryClientDirectory,
    InMemoryExemptions, InMemoryRateLimitRepository, LogMetricsSink, MetricsSink, PolicyResolution,
    RateLimitRepository, TimeRangeResolution,
};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::throttling::{InterruptHandle, ThrottleError, ThrottlingStrategies, ThrottlingStrategy};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

type RecordKey = (String, String);

/// One async mutex per stored record, present only while a request holds or waits on it.
#[derive(Debug, Default)]
struct RecordLocks {
    locks: DashMap<RecordKey, Arc<Mutex<()>>>,
}

impl RecordLocks {
    fn lease(&self, client_id: &str, endpoint: &str) -> RecordLease<'_> {
        let key = (client_id.to_string(), endpoint.to_string());
        let lock = self.locks.entry(key.clone()).or_default().clone();
        RecordLease { locks: self, key, lock }
    }

    fn len(&self) -> usize {
        self.locks.len()
    }
}

/// A handle on one record's mutex; the last lease out removes the entry.
struct RecordLease<'a> {
    locks: &'a RecordLocks,
    key: RecordKey,
    lock: Arc<Mutex<()>>,
}

impl Drop for RecordLease<'_> {
    fn drop(&mut self) {
        // Two references left: the map's and this lease's.
        self.locks
            .locks
            .remove_if(&self.key, |_, lock| Arc::ptr_eq(lock, &self.lock) && Arc::strong_count(lock) == 2);
    }
}

/// Admission control for `(endpoint, client)` requests.
#[derive(Debug, Clone)]
pub struct RateLimitService {
    coordinator: Arc<ConfigCoordinator>,
    context: Arc<RateLimitContext>,
    strategies: Arc<ThrottlingStrategies>,
    repository: Arc<dyn RateLimitRepository>,
    clients: Arc<dyn ClientIdentification>,
    policies: Arc<dyn PolicyResolution>,
    time_ranges: Arc<dyn TimeRangeResolution>,
    metrics: Arc<dyn MetricsSink>,
    records: Arc<RecordLocks>,
}

impl RateLimitService {
    /// Service over `config` with in-memory adapters and the system clock.
    pub fn new(config: RateLimitConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: RateLimitConfig) -> RateLimitServiceBuilder {
        RateLimitServiceBuilder::new(config)
    }

    /// Decide for one request from `client_id` on `endpoint`.
    ///
    /// Returns the decision once throttling has completed. A denied request returns
    /// `Ok(denied)` under the delay and backoff strategies, and `Err(RejectedByPolicy)` under the
    /// reject strategy.
    pub async fn check_rate_limit(&self, endpoint: &str, client_id: &str) -> Result<RateLimitResult> {
        let client = self.clients.identify(client_id).await;
        let time_range = self.time_ranges.current_time_range();
        let (admission, strategy) = self.admit(endpoint, client_id, &client, &time_range).await?;

        if admission.is_allowed() {
            self.metrics.record_success(endpoint, &client);
        } else {
            self.metrics.record_exceeded(endpoint, &client);
            tracing::info!(
                endpoint,
                client_id,
                retry_after_ms = admission.result.retry_after().as_millis() as u64,
                strategy = %strategy.kind(),
                "Rate limit exceeded"
            );
        }

        strategy.throttle(&admission.result).await.map_err(|err| match err {
            ThrottleError::Rejected { retry_after } => RateLimitError::RejectedByPolicy {
                client_id: client_id.to_string(),
                endpoint: endpoint.to_string(),
                retry_after,
            },
            ThrottleError::Interrupted { retry_after } => RateLimitError::InterruptedWait {
                client_id: client_id.to_string(),
                endpoint: endpoint.to_string(),
                retry_after,
            },
        })?;
        Ok(admission.result)
    }

    /// Load, decide and persist one record while holding its lock.
    async fn admit(
        &self,
        endpoint: &str,
        client_id: &str,
        client: &Client,
        time_range: &str,
    ) -> Result<(Admission, Arc<dyn ThrottlingStrategy>)> {
        let lease = self.records.lease(client_id, endpoint);
        let _held = lease.lock.lock().await;

        let stored = self.repository.get(client_id, endpoint).await;
        let (admission, strategy) = self.decide(endpoint, client.clone(), time_range, &stored)?;
        if admission.is_allowed() {
            self.repository.save(client_id, endpoint, admission.rate_limit.increment_request_count()).await;
        }
        Ok((admission, strategy))
    }

    fn decide(
        &self,
        endpoint: &str,
        client: Client,
        time_range: &str,
        stored: &RateLimit,
    ) -> Result<(Admission, Arc<dyn ThrottlingStrategy>)> {
        let config = self.coordinator.read();
        let client_type = client.client_type();
        let policy = self.policies.resolve(endpoint, client_type, time_range, &config)?;
        let rate_limit = stored.with_client_and_policy(client, policy);
        let admission = self.context.check(endpoint, &rate_limit, &config)?;
        let strategy = self.strategies.strategy_for(endpoint, client_type, &config);
        Ok((admission, strategy))
    }

    /// Validate and publish a new configuration.
    pub fn update_config(&self, config: RateLimitConfig) -> Result<ConfigUpdate> {
        self.coordinator.update(config)
    }

    pub fn config(&self) -> Arc<ConfigSnapshot> {
        self.coordinator.snapshot()
    }

    pub fn breaker(&self) -> &Arc<RateLimitCircuitBreaker> {
        self.coordinator.breaker()
    }

    /// Handle that cuts every in-flight throttling wait short.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.strategies.interrupt_handle().clone()
    }

    pub fn tracked_clients(&self) -> usize {
        self.context.tracked_clients()
    }

    /// Periodically evict idle per-client state until the service is dropped.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_sweeper(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        spawn_sweeper(&self.context, interval)
    }
}

/// Builder for [`RateLimitService`]; unset collaborators fall back to the in-memory adapters.
#[derive(Debug)]
pub struct RateLimitServiceBuilder {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    interrupt: InterruptHandle,
    breaker: Option<Arc<RateLimitCircuitBreaker>>,
    repository: Option<Arc<dyn RateLimitRepository>>,
    clients: Arc<dyn ClientIdentification>,
    policies: Arc<dyn PolicyResolution>,
    time_ranges: Arc<dyn TimeRangeResolution>,
    exemptions: Arc<dyn ExemptionCheck>,
    metrics: Arc<dyn MetricsSink>,
}

impl RateLimitServiceBuilder {
    fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            sleeper: Arc::new(TokioSleeper),
            interrupt: InterruptHandle::new(),
            breaker: None,
            repository: None,
            clients: Arc::new(InMemoryClientDirectory::new()),
            policies: Arc::new(ConfigPolicyResolver),
            time_ranges: Arc::new(DefaultTimeRange),
            exemptions: Arc::new(InMemoryExemptions::new()),
            metrics: Arc::new(LogMetricsSink),
        }
    }

    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn sleeper(mut self, sleeper: impl Sleeper + 'static) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn interrupt(mut self, interrupt: InterruptHandle) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Share an existing breaker; it is reconfigured from the service configuration on build.
    pub fn breaker(mut self, breaker: Arc<RateLimitCircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn repository(mut self, repository: Arc<dyn RateLimitRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn clients(mut self, clients: Arc<dyn ClientIdentification>) -> Self {
        self.clients = clients;
        self
    }

    pub fn policies(mut self, policies: Arc<dyn PolicyResolution>) -> Self {
        self.policies = policies;
        self
    }

    pub fn time_ranges(mut self, time_ranges: Arc<dyn TimeRangeResolution>) -> Self {
        self.time_ranges = time_ranges;
        self
    }

    pub fn exemptions(mut self, exemptions: Arc<dyn ExemptionCheck>) -> Self {
        self.exemptions = exemptions;
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn build(self) -> Result<RateLimitService> {
        let breaker_config = self.config.circuit_breaker_config()?;
        let breaker = match self.breaker {
            Some(breaker) => breaker,
            None => Arc::new(RateLimitCircuitBreaker::from_config(breaker_config).with_shared_clock(self.clock.clone())),
        };
        let coordinator = Arc::new(ConfigCoordinator::new(self.config, breaker.clone())?);

        let context = Arc::new(RateLimitContext::new(self.exemptions, breaker, self.clock.clone()));
        let strategies = Arc::new(ThrottlingStrategies::new(self.sleeper, self.interrupt));
        coordinator.register(context.clone());
        coordinator.register(strategies.clone());

        let repository = self
            .repository
            .unwrap_or_else(|| Arc::new(InMemoryRateLimitRepository::new(self.clock.clone())));

        Ok(RateLimitService {
            coordinator,
            context,
            strategies,
            repository,
            clients: self.clients,
            policies: self.policies,
            time_ranges: self.time_ranges,
            metrics: self.metrics,
            records: Arc::new(RecordLocks::default()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::domain::{AlgorithmType, ClientType, ThrottlingStrategyType};
    use crate::ports::MemoryMetricsSink;
    use crate::sleeper::TrackingSleeper;
    use std::collections::HashMap;

    fn config(algorithm: AlgorithmType, strategy: ThrottlingStrategyType) -> RateLimitConfig {
        RateLimitConfig {
            default_algorithm: algorithm,
            default_throttling_strategy: strategy,
            requests_per_second: [(ClientType::Standard, 2), (ClientType::Premium, 4)].into_iter().collect(),
            ..RateLimitConfig::default()
        }
    }

    #[tokio::test]
    async fn admits_up_to_the_tier_rate_then_throttles() {
        let clock = ManualClock::new(10_000);
        let sleeper = TrackingSleeper::new();
        let metrics = Arc::new(MemoryMetricsSink::new());
        let service = RateLimitService::builder(config(AlgorithmType::FixedWindow, ThrottlingStrategyType::Delay))
            .clock(clock.clone())
            .sleeper(sleeper.clone())
            .metrics(metrics.clone())
            .build()
            .unwrap();

        assert!(service.check_rate_limit("/a", "c1").await.unwrap().is_allowed());
        assert!(service.check_rate_limit("/a", "c1").await.unwrap().is_allowed());
        let denied = service.check_rate_limit("/a", "c1").await.unwrap();
        assert!(!denied.is_allowed());
        assert_eq!(sleeper.calls(), vec![denied.retry_after()]);
        assert_eq!(metrics.successes("/a", "c1"), 2);
        assert_eq!(metrics.exceeded("/a", "c1"), 1);
    }

    #[tokio::test]
    async fn admitted_requests_are_persisted() {
        let clock = ManualClock::new(10_000);
        let repository = Arc::new(InMemoryRateLimitRepository::new(Arc::new(clock.clone())));
        let service = RateLimitService::builder(config(AlgorithmType::Quota, ThrottlingStrategyType::Reject))
            .clock(clock.clone())
            .repository(repository.clone())
            .build()
            .unwrap();

        service.check_rate_limit("/q", "c1").await.unwrap();
        service.check_rate_limit("/q", "c1").await.unwrap();
        let stored = repository.get("c1", "/q").await;
        assert_eq!(stored.request_count(), 2);
        assert_eq!(stored.quota_used(), 2);
        assert_eq!(service.records.len(), 0);
    }

    #[tokio::test]
    async fn record_lock_is_shared_while_leased_and_dropped_after() {
        let records = RecordLocks::default();
        let first = records.lease("c1", "/a");
        let second = records.lease("c1", "/a");
        assert!(Arc::ptr_eq(&first.lock, &second.lock));
        assert_eq!(records.len(), 1);

        let held = first.lock.lock().await;
        assert!(second.lock.try_lock().is_err());
        drop(held);

        drop(first);
        assert_eq!(records.len(), 1);
        drop(second);
        assert_eq!(records.len(), 0);
    }

    #[tokio::test]
    async fn reject_strategy_surfaces_an_error_with_context() {
        let clock = ManualClock::new(10_000);
        let service = RateLimitService::builder(config(AlgorithmType::FixedWindow, ThrottlingStrategyType::Reject))
            .clock(clock)
            .build()
            .unwrap();

        service.check_rate_limit("/a", "c1").await.unwrap();
        service.check_rate_limit("/a", "c1").await.unwrap();
        match service.check_rate_limit("/a", "c1").await.unwrap_err() {
            RateLimitError::RejectedByPolicy { client_id, endpoint, retry_after } => {
                assert_eq!(client_id, "c1");
                assert_eq!(endpoint, "/a");
                assert!(retry_after > Duration::ZERO);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn client_tier_selects_the_rate() {
        let clock = ManualClock::new(10_000);
        let clients = Arc::new(InMemoryClientDirectory::new());
        clients.update_client_type("gold", ClientType::Premium).await;
        let service = RateLimitService::builder(config(AlgorithmType::FixedWindow, ThrottlingStrategyType::Reject))
            .clock(clock)
            .clients(clients)
            .sleeper(TrackingSleeper::new())
            .build()
            .unwrap();

        for _ in 0..4 {
            assert!(service.check_rate_limit("/a", "gold").await.unwrap().is_allowed());
        }
        assert!(service.check_rate_limit("/a", "gold").await.unwrap_err().is_rejected());
    }

    #[tokio::test]
    async fn exempt_clients_skip_limiting() {
        let exemptions = Arc::new(InMemoryExemptions::new());
        exemptions.add("ops");
        let service = RateLimitService::builder(config(AlgorithmType::FixedWindow, ThrottlingStrategyType::Reject))
            .clock(ManualClock::new(10_000))
            .exemptions(exemptions)
            .build()
            .unwrap();

        for _ in 0..20 {
            assert!(service.check_rate_limit("/a", "ops").await.unwrap().is_allowed());
        }
        assert_eq!(service.tracked_clients(), 0);
    }

    #[tokio::test]
    async fn update_config_switches_algorithms_and_strategies() {
        let clock = ManualClock::new(10_000);
        let sleeper = TrackingSleeper::new();
        let service = RateLimitService::builder(config(AlgorithmType::FixedWindow, ThrottlingStrategyType::Reject))
            .clock(clock)
            .sleeper(sleeper.clone())
            .build()
            .unwrap();

        service.check_rate_limit("/a", "c1").await.unwrap();
        service.check_rate_limit("/a", "c1").await.unwrap();
        assert!(service.check_rate_limit("/a", "c1").await.is_err());

        let mut next = config(AlgorithmType::FixedWindow, ThrottlingStrategyType::Delay);
        next.throttling_strategies =
            HashMap::from([("/a".to_string(), HashMap::from([(ClientType::Standard, ThrottlingStrategyType::Delay)]))]);
        let update = service.update_config(next).unwrap();
        assert_eq!(update.new.version, 2);
        assert_eq!(service.config().version, 2);

        // Fresh limiter state after the reload, then a delayed denial instead of an error.
        service.check_rate_limit("/a", "c1").await.unwrap();
        service.check_rate_limit("/a", "c1").await.unwrap();
        assert!(!service.check_rate_limit("/a", "c1").await.unwrap().is_allowed());
        assert_eq!(sleeper.calls().len(), 1);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_at_build() {
        let bad = RateLimitConfig { sliding_window_size: 0, ..RateLimitConfig::default() };
        assert!(RateLimitService::new(bad).is_err());
    }
}
