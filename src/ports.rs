//! Collaborators the engine talks to, plus in-memory adapters.
//!
//! Storage-shaped ports (`RateLimitRepository`, `ClientIdentification`) are async so real
//! backends can do I/O. Lookups consulted while a decision is being made (`PolicyResolution`,
//! `ExemptionCheck`) and fire-and-forget sinks are synchronous.

use crate::clock::{Clock, SystemClock};
use crate::config::RateLimitConfig;
use crate::domain::{Client, ClientType, Policy, RateLimit};
use crate::error::Result;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;

/// Stored accounting records keyed by `(client_id, endpoint)`.
#[async_trait]
pub trait RateLimitRepository: Send + Sync + std::fmt::Debug {
    /// Fetch the record, creating the default one on first use.
    async fn get(&self, client_id: &str, endpoint: &str) -> RateLimit;

    async fn save(&self, client_id: &str, endpoint: &str, rate_limit: RateLimit);
}

/// Rate used for records created by [`InMemoryRateLimitRepository`] before any policy applies.
pub const DEFAULT_REQUESTS_PER_SECOND: u32 = 10;

#[derive(Debug, Clone)]
pub struct InMemoryRateLimitRepository {
    records: Arc<DashMap<(String, String), RateLimit>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryRateLimitRepository {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl InMemoryRateLimitRepository {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { records: Arc::new(DashMap::new()), clock }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn default_record(&self, client_id: &str) -> RateLimit {
        RateLimit::new(
            Client::new(client_id, ClientType::Standard),
            Policy::Limited { requests_per_second: DEFAULT_REQUESTS_PER_SECOND },
            self.clock.now_millis(),
        )
    }
}

#[async_trait]
impl RateLimitRepository for InMemoryRateLimitRepository {
    async fn get(&self, client_id: &str, endpoint: &str) -> RateLimit {
        self.records
            .entry((client_id.to_string(), endpoint.to_string()))
            .or_insert_with(|| self.default_record(client_id))
            .clone()
    }

    async fn save(&self, client_id: &str, endpoint: &str, rate_limit: RateLimit) {
        self.records.insert((client_id.to_string(), endpoint.to_string()), rate_limit);
    }
}

/// Maps a raw client id to a [`Client`] and its tier.
#[async_trait]
pub trait ClientIdentification: Send + Sync + std::fmt::Debug {
    async fn identify(&self, client_id: &str) -> Client;

    /// Move a client to another tier; returns the updated client.
    async fn update_client_type(&self, client_id: &str, client_type: ClientType) -> Client;

    /// Forget one client's cached identity.
    async fn invalidate(&self, client_id: &str);

    async fn clear(&self);
}

/// Directory of known clients; unknown ids are `Standard`.
#[derive(Debug, Clone, Default)]
pub struct InMemoryClientDirectory {
    clients: Arc<DashMap<String, Client>>,
}

impl InMemoryClientDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClientIdentification for InMemoryClientDirectory {
    async fn identify(&self, client_id: &str) -> Client {
        self.clients
            .entry(client_id.to_string())
            .or_insert_with(|| Client::new(client_id, ClientType::Standard))
            .clone()
    }

    async fn update_client_type(&self, client_id: &str, client_type: ClientType) -> Client {
        let client = Client::new(client_id, client_type);
        self.clients.insert(client_id.to_string(), client.clone());
        tracing::info!(client_id, client_type = %client_type, "Client tier updated");
        client
    }

    async fn invalidate(&self, client_id: &str) {
        self.clients.remove(client_id);
    }

    async fn clear(&self) {
        self.clients.clear();
    }
}

/// Chooses the policy for a request.
pub trait PolicyResolution: Send + Sync + std::fmt::Debug {
    fn resolve(
        &self,
        endpoint: &str,
        client_type: ClientType,
        time_range: &str,
        config: &RateLimitConfig,
    ) -> Result<Policy>;
}

/// Per-tier rates from the configuration; endpoint and time range are not consulted.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfigPolicyResolver;

impl PolicyResolution for ConfigPolicyResolver {
    fn resolve(
        &self,
        _endpoint: &str,
        client_type: ClientType,
        _time_range: &str,
        config: &RateLimitConfig,
    ) -> Result<Policy> {
        config.policy_for(client_type)
    }
}

/// Label for the current time of day, used to pick time-based policies.
pub trait TimeRangeResolution: Send + Sync + std::fmt::Debug {
    fn current_time_range(&self) -> String;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTimeRange;

impl TimeRangeResolution for DefaultTimeRange {
    fn current_time_range(&self) -> String {
        "default".to_string()
    }
}

/// Clients that bypass rate limiting entirely.
pub trait ExemptionCheck: Send + Sync + std::fmt::Debug {
    fn is_exempt(&self, client: &Client) -> bool;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryExemptions {
    ids: Arc<DashSet<String>>,
}

impl InMemoryExemptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, client_id: impl Into<String>) {
        let client_id = client_id.into();
        tracing::info!(client_id = %client_id, "Client exempted from rate limiting");
        self.ids.insert(client_id);
    }

    pub fn remove(&self, client_id: &str) -> bool {
        self.ids.remove(client_id).is_some()
    }
}

impl ExemptionCheck for InMemoryExemptions {
    fn is_exempt(&self, client: &Client) -> bool {
        self.ids.contains(client.id())
    }
}

/// Outcome counters per endpoint and client.
pub trait MetricsSink: Send + Sync + std::fmt::Debug {
    fn record_success(&self, endpoint: &str, client: &Client);

    fn record_exceeded(&self, endpoint: &str, client: &Client);
}

/// Emits outcomes as `tracing` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMetricsSink;

impl MetricsSink for LogMetricsSink {
    fn record_success(&self, endpoint: &str, client: &Client) {
        tracing::info!(
            endpoint,
            client_id = client.id(),
            client_type = %client.client_type(),
            outcome = "allowed",
            "rate_limit_outcome"
        );
    }

    fn record_exceeded(&self, endpoint: &str, client: &Client) {
        tracing::info!(
            endpoint,
            client_id = client.id(),
            client_type = %client.client_type(),
            outcome = "exceeded",
            "rate_limit_outcome"
        );
    }
}

/// Counts outcomes in memory; useful in tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryMetricsSink {
    counts: Arc<DashMap<(String, String), (u64, u64)>>,
}

impl MemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn successes(&self, endpoint: &str, client_id: &str) -> u64 {
        self.get(endpoint, client_id).0
    }

    pub fn exceeded(&self, endpoint: &str, client_id: &str) -> u64 {
        self.get(endpoint, client_id).1
    }

    pub fn clear(&self) {
        self.counts.clear();
    }

    fn get(&self, endpoint: &str, client_id: &str) -> (u64, u64) {
        self.counts
            .get(&(endpoint.to_string(), client_id.to_string()))
            .map(|c| *c)
            .unwrap_or_default()
    }

    fn bump(&self, endpoint: &str, client: &Client, exceeded: bool) {
        let mut entry = self.counts.entry((endpoint.to_string(), client.id().to_string())).or_default();
        if exceeded {
            entry.1 += 1;
        } else {
            entry.0 += 1;
        }
    }
}

impl MetricsSink for MemoryMetricsSink {
    fn record_success(&self, endpoint: &str, client: &Client) {
        self.bump(endpoint, client, false);
    }

    fn record_exceeded(&self, endpoint: &str, client: &Client) {
        self.bump(endpoint, client, true);
    }
}
