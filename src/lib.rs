#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # turnstile
//!
//! Admission control for Rust services: decide, per client and endpoint, whether a request may
//! proceed, and what happens to it when it may not.
//!
//! ## Features
//!
//! - **Five algorithms**: fixed window, sliding window, token bucket, leaky bucket and daily quota
//! - **Optimistic fast path** with a per-client write-lock fallback
//! - **Shared circuit breaker** that fails fast while the limiter itself is denying heavily
//! - **Throttling strategies**: delay, reject, or exponential backoff, all interruptible
//! - **Hot reload** of policy without readers observing a half-applied change
//!
//! ## Quick Start
//!
//! ```rust
//! use turnstile::{RateLimitConfig, RateLimitService, ThrottlingStrategyType};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), turnstile::RateLimitError> {
//!     let config = RateLimitConfig {
//!         default_throttling_strategy: ThrottlingStrategyType::Reject,
//!         ..RateLimitConfig::default()
//!     };
//!     let service = RateLimitService::new(config)?;
//!
//!     let result = service.check_rate_limit("/orders", "client-42").await?;
//!     assert!(result.is_allowed());
//!     Ok(())
//! }
//! ```
//!
//! Individual pieces are usable on their own:
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use turnstile::clock::ManualClock;
//! use turnstile::{build_rate_limiter, AlgorithmType, RateLimitCircuitBreaker, RateLimitConfig, RateLimiter};
//! use turnstile::{Client, ClientType, Policy, RateLimit};
//!
//! let clock = ManualClock::new(0);
//! let breaker = Arc::new(RateLimitCircuitBreaker::new(5, Duration::from_secs(30)).unwrap());
//! let limiter = build_rate_limiter(
//!     AlgorithmType::FixedWindow,
//!     &RateLimitConfig::default(),
//!     breaker,
//!     Arc::new(clock.clone()),
//! )
//! .unwrap();
//!
//! let value = RateLimit::new(Client::new("c1", ClientType::Standard), Policy::limited(1).unwrap(), 0);
//! assert!(limiter.check_rate_limit(&value).unwrap().is_allowed());
//! assert!(!limiter.check_rate_limit(&value).unwrap().is_allowed());
//! ```

pub mod algorithm;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod context;
pub mod domain;
pub mod dynamic_config;
pub mod error;
pub mod guard;
pub mod ports;
pub mod prelude;
pub mod service;
pub mod sleeper;
pub mod state;
pub mod throttling;

// Re-exports
pub use algorithm::{build_rate_limiter, Estimate, RateLimitAlgorithm, RateLimiter};
pub use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerError, CircuitState, RateLimitCircuitBreaker};
pub use clock::{Clock, ManualClock, MonotonicClock, SystemClock};
pub use config::RateLimitConfig;
pub use context::RateLimitContext;
pub use domain::{
    Admission, AlgorithmType, Client, ClientType, Policy, RateLimit, RateLimitResult, ThrottlingStrategyType,
};
pub use dynamic_config::{ConfigCoordinator, ConfigListener, ConfigSnapshot, ConfigUpdate, DynamicConfig};
pub use error::{RateLimitError, Result};
pub use guard::{spawn_sweeper, ConcurrencyGuard, IdleSweep, LockPolicy};
pub use ports::{
    ClientIdentification, ExemptionCheck, InMemoryClientDirectory, InMemoryExemptions, InMemoryRateLimitRepository,
    MetricsSink, PolicyResolution, RateLimitRepository, TimeRangeResolution,
};
pub use service::{RateLimitService, RateLimitServiceBuilder};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use throttling::{InterruptHandle, ThrottleError, ThrottlingStrategies, ThrottlingStrategy};
