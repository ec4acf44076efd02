//! Circuit breaker shared by every rate-limiting algorithm.
//!
//! The breaker counts consecutive denials reported by the algorithms. Once the count reaches the
//! threshold, the next closed-state query opens the circuit and every check fails fast until the
//! reset timeout has elapsed.
//!
//! State machine:
//! - **Closed → Open**: evaluated lazily inside [`RateLimitCircuitBreaker::is_circuit_closed`]
//!   when `failure_count >= failure_threshold`. The failure that crosses the threshold does not
//!   open the circuit by itself; the following query does (one-check lag).
//! - **Open → HalfOpen**: the first query after `reset_timeout` has elapsed.
//! - **HalfOpen → Closed**: a recorded success. Failures are cleared.
//! - **HalfOpen → Open**: a recorded failure. Failures are cleared and the open timestamp renewed.
//!
//! All transitions happen under one mutex, so a breaker is never observed both open and
//! half-open. Clones of the owning `Arc` share one lifecycle; tests build isolated instances.

use crate::clock::{Clock, SystemClock};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Every check is denied until the reset timeout elapses.
    Open,
    /// Probe mode: checks run, and the next recorded outcome decides the state.
    HalfOpen,
}

/// Validated configuration for the circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    failure_threshold: u32,
    reset_timeout: Duration,
}

/// Errors produced when validating breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitBreakerError {
    /// Failure threshold must be > 0.
    InvalidFailureThreshold {
        /// Value provided by caller.
        provided: u32,
    },
    /// Reset timeout must be > 0.
    InvalidResetTimeout(Duration),
}

impl std::fmt::Display for CircuitBreakerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerError::InvalidFailureThreshold { provided } => {
                write!(f, "failure_threshold must be > 0 (got {})", provided)
            }
            CircuitBreakerError::InvalidResetTimeout(timeout) => {
                write!(f, "reset_timeout must be > 0 (got {:?})", timeout)
            }
        }
    }
}

impl std::error::Error for CircuitBreakerError {}

impl CircuitBreakerConfig {
    /// Create a config with validation.
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Result<Self, CircuitBreakerError> {
        if failure_threshold == 0 {
            return Err(CircuitBreakerError::InvalidFailureThreshold { provided: 0 });
        }
        if reset_timeout.is_zero() {
            return Err(CircuitBreakerError::InvalidResetTimeout(reset_timeout));
        }
        Ok(Self { failure_threshold, reset_timeout })
    }

    /// Consecutive failures before the circuit opens.
    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// Duration to stay Open before Half-Open.
    pub fn reset_timeout(&self) -> Duration {
        self.reset_timeout
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_open_millis: Option<u64>,
    config: CircuitBreakerConfig,
}

impl BreakerState {
    fn closed(config: CircuitBreakerConfig) -> Self {
        Self { state: CircuitState::Closed, failure_count: 0, last_open_millis: None, config }
    }
}

/// Three-state failure tracker guarding every admission check.
#[derive(Debug)]
pub struct RateLimitCircuitBreaker {
    inner: Mutex<BreakerState>,
    clock: Arc<dyn Clock>,
}

impl RateLimitCircuitBreaker {
    /// Create a breaker, validating threshold and timeout.
    ///
    /// # Examples
    /// ```
    /// use turnstile::RateLimitCircuitBreaker;
    /// use std::time::Duration;
    /// let breaker = RateLimitCircuitBreaker::new(5, Duration::from_secs(30)).unwrap();
    /// assert!(breaker.is_circuit_closed());
    /// ```
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Result<Self, CircuitBreakerError> {
        Ok(Self::from_config(CircuitBreakerConfig::new(failure_threshold, reset_timeout)?))
    }

    /// Create a breaker from an already validated config.
    pub fn from_config(config: CircuitBreakerConfig) -> Self {
        Self { inner: Mutex::new(BreakerState::closed(config)), clock: Arc::new(SystemClock) }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(self, clock: C) -> Self {
        self.with_shared_clock(Arc::new(clock))
    }

    /// Share a clock with the rest of the engine.
    pub fn with_shared_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// True when checks may proceed (Closed or HalfOpen).
    ///
    /// This query drives the lazy transitions: it opens a closed circuit whose failure count has
    /// reached the threshold, and moves an open circuit to half-open once the reset timeout has
    /// elapsed.
    pub fn is_circuit_closed(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                tracing::debug!("Circuit breaker: half-open trial request");
                true
            }
            CircuitState::Open => {
                let opened_at = inner.last_open_millis.unwrap_or(0);
                let elapsed = self.clock.now_millis().saturating_sub(opened_at);
                if u128::from(elapsed) >= inner.config.reset_timeout.as_millis() {
                    inner.state = CircuitState::HalfOpen;
                    tracing::info!(elapsed_ms = elapsed, "Circuit breaker → half-open");
                    true
                } else {
                    false
                }
            }
            CircuitState::Closed => {
                if inner.failure_count >= inner.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.last_open_millis = Some(self.clock.now_millis());
                    tracing::error!(
                        failures = inner.failure_count,
                        threshold = inner.config.failure_threshold,
                        "Circuit breaker → open"
                    );
                    false
                } else {
                    true
                }
            }
        }
    }

    /// Record an admitted request.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Closed;
            inner.last_open_millis = None;
            tracing::info!("Circuit breaker → closed");
        }
        inner.failure_count = 0;
    }

    /// Record a denied request.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Open;
            inner.failure_count = 0;
            inner.last_open_millis = Some(self.clock.now_millis());
            tracing::warn!("Circuit breaker: trial request failed → open");
        } else {
            inner.failure_count = inner.failure_count.saturating_add(1);
        }
    }

    /// Force Closed with zero failures.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        let config = inner.config.clone();
        *inner = BreakerState::closed(config);
        tracing::info!("Circuit breaker reset");
    }

    /// Swap thresholds and reset, as one transition.
    pub fn reconfigure(&self, config: CircuitBreakerConfig) {
        let mut inner = self.inner.lock();
        tracing::info!(
            failure_threshold = config.failure_threshold,
            reset_timeout_ms = config.reset_timeout.as_millis() as u64,
            "Circuit breaker reconfigured"
        );
        *inner = BreakerState::closed(config);
    }

    /// Current state without triggering lazy transitions.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    pub fn failure_threshold(&self) -> u32 {
        self.inner.lock().config.failure_threshold
    }

    /// Retry hint handed to callers while the circuit is open.
    pub fn reset_timeout(&self) -> Duration {
        self.inner.lock().config.reset_timeout
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        self.inner.lock().config.clone()
    }
}
