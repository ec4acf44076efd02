//! Convenient re-exports for common turnstile types.
pub use crate::{
    algorithm::{build_rate_limiter, RateLimiter},
    circuit_breaker::{CircuitBreakerConfig, CircuitState, RateLimitCircuitBreaker},
    config::RateLimitConfig,
    domain::{AlgorithmType, Client, ClientType, Policy, RateLimit, RateLimitResult, ThrottlingStrategyType},
    ports::{ClientIdentification, ExemptionCheck, MetricsSink, RateLimitRepository},
    service::RateLimitService,
    throttling::InterruptHandle,
    RateLimitError,
};
