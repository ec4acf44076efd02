//! Domain values shared by every component.
//!
//! `RateLimit` is an immutable value: every mutator consumes or borrows it and returns a new
//! value. The repository owns the stored copy; algorithms hand back the value the caller should
//! persist inside an [`Admission`].

use crate::error::{RateLimitError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// `token-bucket`, `token_bucket` and `TOKEN_BUCKET` all resolve to the same name.
fn normalize(name: &str) -> String {
    name.trim().replace('-', "_").to_ascii_uppercase()
}

/// Client tier. Tiers map to per-second rates in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ClientType {
    Standard,
    Premium,
    Vip,
    Enterprise,
    Custom,
    /// Internal callers get an unrestricted policy.
    Internal,
}

impl ClientType {
    pub const ALL: [ClientType; 6] = [
        ClientType::Standard,
        ClientType::Premium,
        ClientType::Vip,
        ClientType::Enterprise,
        ClientType::Custom,
        ClientType::Internal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ClientType::Standard => "STANDARD",
            ClientType::Premium => "PREMIUM",
            ClientType::Vip => "VIP",
            ClientType::Enterprise => "ENTERPRISE",
            ClientType::Custom => "CUSTOM",
            ClientType::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ClientType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClientType {
    type Err = RateLimitError;

    fn from_str(s: &str) -> Result<Self> {
        match normalize(s).as_str() {
            "STANDARD" => Ok(ClientType::Standard),
            "PREMIUM" => Ok(ClientType::Premium),
            "VIP" => Ok(ClientType::Vip),
            "ENTERPRISE" => Ok(ClientType::Enterprise),
            "CUSTOM" => Ok(ClientType::Custom),
            "INTERNAL" => Ok(ClientType::Internal),
            _ => Err(RateLimitError::UnsupportedClientType(s.to_string())),
        }
    }
}

impl TryFrom<String> for ClientType {
    type Error = RateLimitError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ClientType> for String {
    fn from(value: ClientType) -> Self {
        value.as_str().to_string()
    }
}

/// Rate-limiting algorithm selectable per endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AlgorithmType {
    FixedWindow,
    SlidingWindow,
    TokenBucket,
    LeakyBucket,
    Quota,
}

impl AlgorithmType {
    pub const ALL: [AlgorithmType; 5] = [
        AlgorithmType::FixedWindow,
        AlgorithmType::SlidingWindow,
        AlgorithmType::TokenBucket,
        AlgorithmType::LeakyBucket,
        AlgorithmType::Quota,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AlgorithmType::FixedWindow => "FIXED_WINDOW",
            AlgorithmType::SlidingWindow => "SLIDING_WINDOW",
            AlgorithmType::TokenBucket => "TOKEN_BUCKET",
            AlgorithmType::LeakyBucket => "LEAKY_BUCKET",
            AlgorithmType::Quota => "QUOTA",
        }
    }
}

impl fmt::Display for AlgorithmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlgorithmType {
    type Err = RateLimitError;

    fn from_str(s: &str) -> Result<Self> {
        match normalize(s).as_str() {
            "FIXED_WINDOW" => Ok(AlgorithmType::FixedWindow),
            "SLIDING_WINDOW" => Ok(AlgorithmType::SlidingWindow),
            "TOKEN_BUCKET" => Ok(AlgorithmType::TokenBucket),
            "LEAKY_BUCKET" => Ok(AlgorithmType::LeakyBucket),
            "QUOTA" => Ok(AlgorithmType::Quota),
            _ => Err(RateLimitError::UnsupportedAlgorithmType(s.to_string())),
        }
    }
}

impl TryFrom<String> for AlgorithmType {
    type Error = RateLimitError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<AlgorithmType> for String {
    fn from(value: AlgorithmType) -> Self {
        value.as_str().to_string()
    }
}

/// Post-decision handling of denied requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ThrottlingStrategyType {
    Delay,
    Reject,
    ExponentialBackoff,
}

impl ThrottlingStrategyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThrottlingStrategyType::Delay => "DELAY",
            ThrottlingStrategyType::Reject => "REJECT",
            ThrottlingStrategyType::ExponentialBackoff => "EXPONENTIAL_BACKOFF",
        }
    }
}

impl fmt::Display for ThrottlingStrategyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ThrottlingStrategyType {
    type Err = RateLimitError;

    fn from_str(s: &str) -> Result<Self> {
        match normalize(s).as_str() {
            "DELAY" => Ok(ThrottlingStrategyType::Delay),
            "REJECT" => Ok(ThrottlingStrategyType::Reject),
            "EXPONENTIAL_BACKOFF" => Ok(ThrottlingStrategyType::ExponentialBackoff),
            _ => Err(RateLimitError::UnsupportedThrottlingStrategy(s.to_string())),
        }
    }
}

impl TryFrom<String> for ThrottlingStrategyType {
    type Error = RateLimitError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ThrottlingStrategyType> for String {
    fn from(value: ThrottlingStrategyType) -> Self {
        value.as_str().to_string()
    }
}

/// A caller identity plus its tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Client {
    id: String,
    client_type: ClientType,
}

impl Client {
    pub fn new(id: impl Into<String>, client_type: ClientType) -> Self {
        Self { id: id.into(), client_type }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn client_type(&self) -> ClientType {
        self.client_type
    }
}

/// Rate policy applied to one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Policy {
    /// At most `requests_per_second` admissions per configured window.
    Limited { requests_per_second: u32 },
    /// No limit; admitted without touching per-client state.
    Unrestricted,
}

impl Policy {
    /// Build a limited policy; `requests_per_second` must be at least 1.
    pub fn limited(requests_per_second: u32) -> Result<Self> {
        let policy = Policy::Limited { requests_per_second };
        policy.validate()?;
        Ok(policy)
    }

    /// Per-second rate, or `None` for the unrestricted sentinel.
    pub fn requests_per_second(&self) -> Option<u32> {
        match self {
            Policy::Limited { requests_per_second } => Some(*requests_per_second),
            Policy::Unrestricted => None,
        }
    }

    pub fn is_unrestricted(&self) -> bool {
        matches!(self, Policy::Unrestricted)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        match self {
            Policy::Limited { requests_per_second: 0 } => {
                Err(RateLimitError::validation("policy requests_per_second must be >= 1"))
            }
            _ => Ok(()),
        }
    }
}

/// Per (client, endpoint) accounting record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimit {
    client: Client,
    policy: Policy,
    last_reset_time: u64,
    request_count: u64,
    quota_used: u64,
}

impl RateLimit {
    /// Fresh record with zeroed counters.
    pub fn new(client: Client, policy: Policy, last_reset_time: u64) -> Self {
        Self { client, policy, last_reset_time, request_count: 0, quota_used: 0 }
    }

    /// Same record with explicit counters (used by repositories rehydrating state).
    pub fn with_counts(self, request_count: u64, quota_used: u64) -> Self {
        Self { request_count, quota_used, ..self }
    }

    /// Same counters, current client and policy.
    pub fn with_client_and_policy(&self, client: Client, policy: Policy) -> Self {
        Self { client, policy, ..self.clone() }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    pub fn last_reset_time(&self) -> u64 {
        self.last_reset_time
    }

    pub fn request_count(&self) -> u64 {
        self.request_count
    }

    pub fn quota_used(&self) -> u64 {
        self.quota_used
    }

    pub fn increment_request_count(&self) -> Self {
        Self { request_count: self.request_count.saturating_add(1), ..self.clone() }
    }

    pub fn increment_quota_used(&self) -> Self {
        Self { quota_used: self.quota_used.saturating_add(1), ..self.clone() }
    }

    /// Zero the quota and start a new quota period at `now`.
    pub fn reset_quota_used(&self, now: u64) -> Self {
        Self { quota_used: 0, last_reset_time: now, ..self.clone() }
    }

    /// Zero the request counter and restamp the reset time.
    pub fn reset_request_count(&self, now: u64) -> Self {
        Self { request_count: 0, last_reset_time: now, ..self.clone() }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.client.id.trim().is_empty() {
            return Err(RateLimitError::validation("client id must not be empty"));
        }
        self.policy.validate()
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitResult {
    allowed: bool,
    retry_after: Duration,
}

impl RateLimitResult {
    pub fn allowed() -> Self {
        Self { allowed: true, retry_after: Duration::ZERO }
    }

    /// A denial; a zero hint is raised to one millisecond so `retry_after` is zero iff allowed.
    pub fn denied(retry_after: Duration) -> Self {
        Self { allowed: false, retry_after: retry_after.max(Duration::from_millis(1)) }
    }

    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    pub fn retry_after(&self) -> Duration {
        self.retry_after
    }
}

impl fmt::Display for RateLimitResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.allowed {
            write!(f, "allowed")
        } else {
            write!(f, "denied (retry after {:?})", self.retry_after)
        }
    }
}

/// A decision plus the `RateLimit` value the caller should persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub result: RateLimitResult,
    pub rate_limit: RateLimit,
}

impl Admission {
    pub fn new(result: RateLimitResult, rate_limit: RateLimit) -> Self {
        Self { result, rate_limit }
    }

    pub fn is_allowed(&self) -> bool {
        self.result.is_allowed()
    }
}
