//! Configuration for the admission-control engine.
//!
//! `RateLimitConfig` is plain data: the live copy sits behind
//! [`ConfigCoordinator`](crate::dynamic_config::ConfigCoordinator), which swaps whole values on
//! update. Enumerated settings are written as names (`"TOKEN_BUCKET"`, `"premium"`,
//! `"exponential-backoff"`); unknown names fail with the matching `Unsupported*` error.

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::domain::{AlgorithmType, ClientType, Policy, ThrottlingStrategyType};
use crate::error::{RateLimitError, Result};
use crate::guard::LockPolicy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Full engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawRateLimitConfig")]
pub struct RateLimitConfig {
    /// Per-second rate for each client tier. Tiers without an entry have no policy.
    pub requests_per_second: BTreeMap<ClientType, u32>,

    /// Algorithm for endpoints not listed in `algorithm_by_endpoint`.
    pub default_algorithm: AlgorithmType,

    pub algorithm_by_endpoint: HashMap<String, AlgorithmType>,

    /// Sliding window length in milliseconds.
    pub sliding_window_size: u64,

    /// Token bucket initial tokens and leaky bucket capacity.
    pub bucket_capacity: u64,

    /// Carried for compatibility; token accrual follows the policy rate.
    pub refill_rate: u64,

    /// Fixed window length and token bucket accrual window, in milliseconds.
    pub time_window_millis: u64,

    pub circuit_breaker_failure_threshold: u32,

    pub circuit_breaker_reset_timeout_millis: u64,

    /// Base delay in milliseconds.
    pub exponential_backoff_initial_delay: u64,

    pub exponential_backoff_multiplier: f64,

    /// endpoint → client tier → strategy.
    pub throttling_strategies: HashMap<String, HashMap<ClientType, ThrottlingStrategyType>>,

    pub default_throttling_strategy: ThrottlingStrategyType,

    /// Admissions per quota period.
    pub quota_limit: u64,

    /// Idle time after which per-client algorithm state is evicted, in milliseconds.
    pub client_inactivity_millis: u64,

    pub lock_retries: u32,

    pub lock_timeout_millis: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_requests_per_second(),
            default_algorithm: AlgorithmType::TokenBucket,
            algorithm_by_endpoint: HashMap::new(),
            sliding_window_size: 1_000,
            bucket_capacity: 10,
            refill_rate: 10,
            time_window_millis: 1_000,
            circuit_breaker_failure_threshold: 5,
            circuit_breaker_reset_timeout_millis: 30_000,
            exponential_backoff_initial_delay: 100,
            exponential_backoff_multiplier: 2.0,
            throttling_strategies: HashMap::new(),
            default_throttling_strategy: ThrottlingStrategyType::Delay,
            quota_limit: 10_000,
            client_inactivity_millis: 60 * 60 * 1_000,
            lock_retries: 3,
            lock_timeout_millis: 5_000,
        }
    }
}

fn default_requests_per_second() -> BTreeMap<ClientType, u32> {
    BTreeMap::from([
        (ClientType::Standard, 10),
        (ClientType::Premium, 50),
        (ClientType::Vip, 100),
        (ClientType::Enterprise, 200),
        (ClientType::Custom, 20),
        (ClientType::Internal, 1_000),
    ])
}

fn at_least_one(name: &str, value: u64) -> Result<()> {
    if value < 1 {
        return Err(RateLimitError::Config(format!("{name} must be >= 1 (got {value})")));
    }
    Ok(())
}

impl RateLimitConfig {
    /// Parse and validate a JSON document.
    ///
    /// # Examples
    /// ```
    /// use turnstile::RateLimitConfig;
    /// let config = RateLimitConfig::from_json_str(r#"{"default_algorithm": "sliding-window"}"#).unwrap();
    /// assert_eq!(config.default_algorithm, turnstile::AlgorithmType::SlidingWindow);
    /// assert_eq!(config.quota_limit, RateLimitConfig::default().quota_limit);
    /// ```
    pub fn from_json_str(json: &str) -> Result<Self> {
        let raw: RawRateLimitConfig =
            serde_json::from_str(json).map_err(|e| RateLimitError::Config(e.to_string()))?;
        let config = RateLimitConfig::try_from(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| RateLimitError::Config(e.to_string()))
    }

    /// Enforce the `>= 1` minima on every numeric setting.
    pub fn validate(&self) -> Result<()> {
        for (client_type, rps) in &self.requests_per_second {
            at_least_one(&format!("requests_per_second[{client_type}]"), u64::from(*rps))?;
        }
        at_least_one("sliding_window_size", self.sliding_window_size)?;
        at_least_one("bucket_capacity", self.bucket_capacity)?;
        at_least_one("refill_rate", self.refill_rate)?;
        at_least_one("time_window_millis", self.time_window_millis)?;
        at_least_one("circuit_breaker_failure_threshold", u64::from(self.circuit_breaker_failure_threshold))?;
        at_least_one("circuit_breaker_reset_timeout_millis", self.circuit_breaker_reset_timeout_millis)?;
        at_least_one("exponential_backoff_initial_delay", self.exponential_backoff_initial_delay)?;
        if !(self.exponential_backoff_multiplier.is_finite() && self.exponential_backoff_multiplier >= 1.0) {
            return Err(RateLimitError::Config(format!(
                "exponential_backoff_multiplier must be a finite number >= 1 (got {})",
                self.exponential_backoff_multiplier
            )));
        }
        at_least_one("quota_limit", self.quota_limit)?;
        at_least_one("client_inactivity_millis", self.client_inactivity_millis)?;
        at_least_one("lock_retries", u64::from(self.lock_retries))?;
        at_least_one("lock_timeout_millis", self.lock_timeout_millis)?;
        Ok(())
    }

    /// Policy for a client tier. `Internal` is always unrestricted.
    pub fn policy_for(&self, client_type: ClientType) -> Result<Policy> {
        if client_type == ClientType::Internal {
            return Ok(Policy::Unrestricted);
        }
        match self.requests_per_second.get(&client_type) {
            Some(rps) => Policy::limited(*rps),
            None => Err(RateLimitError::UnsupportedClientType(client_type.to_string())),
        }
    }

    pub fn algorithm_for(&self, endpoint: &str) -> AlgorithmType {
        self.algorithm_by_endpoint.get(endpoint).copied().unwrap_or(self.default_algorithm)
    }

    pub fn throttling_strategy_for(&self, endpoint: &str, client_type: ClientType) -> ThrottlingStrategyType {
        self.throttling_strategies
            .get(endpoint)
            .and_then(|by_type| by_type.get(&client_type))
            .copied()
            .unwrap_or(self.default_throttling_strategy)
    }

    pub fn circuit_breaker_config(&self) -> Result<CircuitBreakerConfig> {
        Ok(CircuitBreakerConfig::new(
            self.circuit_breaker_failure_threshold,
            Duration::from_millis(self.circuit_breaker_reset_timeout_millis),
        )?)
    }

    pub fn lock_policy(&self) -> Result<LockPolicy> {
        LockPolicy::new(self.lock_retries, Duration::from_millis(self.lock_timeout_millis))
    }

    pub fn backoff_initial_delay(&self) -> Duration {
        Duration::from_millis(self.exponential_backoff_initial_delay)
    }
}

/// Wire form with enumerated values kept as names, so each unknown name can be reported with
/// its own error kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct RawRateLimitConfig {
    requests_per_second: BTreeMap<String, u32>,
    default_algorithm: String,
    algorithm_by_endpoint: HashMap<String, String>,
    sliding_window_size: u64,
    bucket_capacity: u64,
    refill_rate: u64,
    time_window_millis: u64,
    circuit_breaker_failure_threshold: u32,
    circuit_breaker_reset_timeout_millis: u64,
    exponential_backoff_initial_delay: u64,
    exponential_backoff_multiplier: f64,
    throttling_strategies: HashMap<String, HashMap<String, String>>,
    default_throttling_strategy: String,
    quota_limit: u64,
    client_inactivity_millis: u64,
    lock_retries: u32,
    lock_timeout_millis: u64,
}

impl Default for RawRateLimitConfig {
    fn default() -> Self {
        RateLimitConfig::default().into()
    }
}

impl From<RateLimitConfig> for RawRateLimitConfig {
    fn from(c: RateLimitConfig) -> Self {
        Self {
            requests_per_second: c.requests_per_second.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
            default_algorithm: c.default_algorithm.to_string(),
            algorithm_by_endpoint: c
                .algorithm_by_endpoint
                .into_iter()
                .map(|(endpoint, algo)| (endpoint, algo.to_string()))
                .collect(),
            sliding_window_size: c.sliding_window_size,
            bucket_capacity: c.bucket_capacity,
            refill_rate: c.refill_rate,
            time_window_millis: c.time_window_millis,
            circuit_breaker_failure_threshold: c.circuit_breaker_failure_threshold,
            circuit_breaker_reset_timeout_millis: c.circuit_breaker_reset_timeout_millis,
            exponential_backoff_initial_delay: c.exponential_backoff_initial_delay,
            exponential_backoff_multiplier: c.exponential_backoff_multiplier,
            throttling_strategies: c
                .throttling_strategies
                .into_iter()
                .map(|(endpoint, by_type)| {
                    (endpoint, by_type.into_iter().map(|(k, v)| (k.to_string(), v.to_string())).collect())
                })
                .collect(),
            default_throttling_strategy: c.default_throttling_strategy.to_string(),
            quota_limit: c.quota_limit,
            client_inactivity_millis: c.client_inactivity_millis,
            lock_retries: c.lock_retries,
            lock_timeout_millis: c.lock_timeout_millis,
        }
    }
}

impl TryFrom<RawRateLimitConfig> for RateLimitConfig {
    type Error = RateLimitError;

    fn try_from(raw: RawRateLimitConfig) -> Result<Self> {
        let requests_per_second = raw
            .requests_per_second
            .into_iter()
            .map(|(name, rps)| Ok((name.parse::<ClientType>()?, rps)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        let algorithm_by_endpoint = raw
            .algorithm_by_endpoint
            .into_iter()
            .map(|(endpoint, name)| Ok((endpoint, name.parse::<AlgorithmType>()?)))
            .collect::<Result<HashMap<_, _>>>()?;
        let throttling_strategies = raw
            .throttling_strategies
            .into_iter()
            .map(|(endpoint, by_type)| {
                let by_type = by_type
                    .into_iter()
                    .map(|(client, strategy)| {
                        Ok((client.parse::<ClientType>()?, strategy.parse::<ThrottlingStrategyType>()?))
                    })
                    .collect::<Result<HashMap<_, _>>>()?;
                Ok((endpoint, by_type))
            })
            .collect::<Result<HashMap<_, _>>>()?;

        Ok(Self {
            requests_per_second,
            default_algorithm: raw.default_algorithm.parse()?,
            algorithm_by_endpoint,
            sliding_window_size: raw.sliding_window_size,
            bucket_capacity: raw.bucket_capacity,
            refill_rate: raw.refill_rate,
            time_window_millis: raw.time_window_millis,
            circuit_breaker_failure_threshold: raw.circuit_breaker_failure_threshold,
            circuit_breaker_reset_timeout_millis: raw.circuit_breaker_reset_timeout_millis,
            exponential_backoff_initial_delay: raw.exponential_backoff_initial_delay,
            exponential_backoff_multiplier: raw.exponential_backoff_multiplier,
            throttling_strategies,
            default_throttling_strategy: raw.default_throttling_strategy.parse()?,
            quota_limit: raw.quota_limit,
            client_inactivity_millis: raw.client_inactivity_millis,
            lock_retries: raw.lock_retries,
            lock_timeout_millis: raw.lock_timeout_millis,
        })
    }
}
