//! Error types for admission decisions, throttling and configuration.
use crate::circuit_breaker::CircuitBreakerError;
use std::time::Duration;
use thiserror::Error;

/// Unified error type for the engine.
///
/// Only `RejectedByPolicy` and `InterruptedWait` describe a denied request; every other variant
/// means no decision could be made and must not be read as allow or deny.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RateLimitError {
    /// Input rejected before any state was touched.
    #[error("invalid rate limit input: {reason}")]
    Validation { reason: String },
    /// The client's exclusive lock could not be acquired within the retry budget.
    #[error(
        "failed to acquire write lock for client '{client_id}' after {attempts} attempts ({timeout:?} each)"
    )]
    LockTimeout { client_id: String, attempts: u32, timeout: Duration },
    /// A throttling delay was interrupted before it elapsed.
    #[error("throttling wait interrupted for client '{client_id}' on '{endpoint}' (retry after {retry_after:?})")]
    InterruptedWait { client_id: String, endpoint: String, retry_after: Duration },
    /// The reject strategy refused a denied request.
    #[error("rate limit exceeded for client '{client_id}' on '{endpoint}'; retry after {retry_after:?}")]
    RejectedByPolicy { client_id: String, endpoint: String, retry_after: Duration },
    /// Unknown algorithm name in configuration.
    #[error("unsupported algorithm type: {0}")]
    UnsupportedAlgorithmType(String),
    /// Unknown client tier, or a tier with no configured policy.
    #[error("unsupported client type: {0}")]
    UnsupportedClientType(String),
    /// Unknown throttling strategy name in configuration.
    #[error("unsupported throttling strategy type: {0}")]
    UnsupportedThrottlingStrategy(String),
    /// Configuration failed validation or could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Circuit breaker settings were rejected.
    #[error(transparent)]
    CircuitBreaker(#[from] CircuitBreakerError),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RateLimitError>;

impl RateLimitError {
    pub(crate) fn validation(reason: impl Into<String>) -> Self {
        Self::Validation { reason: reason.into() }
    }

    /// Check if this error is a pre-mutation validation failure.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }

    /// Check if this error is a lock acquisition timeout.
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }

    /// Check if this error came from the reject strategy.
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::RejectedByPolicy { .. })
    }

    /// Check if a throttling wait was interrupted.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::InterruptedWait { .. })
    }

    /// Retry hint carried by denial-related variants.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RejectedByPolicy { retry_after, .. } | Self::InterruptedWait { retry_after, .. } => {
                Some(*retry_after)
            }
            _ => None,
        }
    }

    /// Client the error refers to, when known.
    pub fn client_id(&self) -> Option<&str> {
        match self {
            Self::LockTimeout { client_id, .. }
            | Self::RejectedByPolicy { client_id, .. }
            | Self::InterruptedWait { client_id, .. } => Some(client_id),
            _ => None,
        }
    }
}
