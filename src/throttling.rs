//! Throttling strategies: what happens to a request after it has been denied.
//!
//! - [`DelayThrottling`] suspends the caller for the denial's retry hint.
//! - [`RejectThrottling`] fails immediately with [`ThrottleError::Rejected`].
//! - [`ExponentialBackoffThrottling`] suspends for `initial_delay × multiplier^(retry_after in s)`.
//!
//! Suspensions go through a [`Sleeper`] (the tokio timer in production) and race an
//! [`InterruptHandle`]. Allowed results pass through every strategy untouched.

use crate::config::RateLimitConfig;
use crate::domain::{ClientType, RateLimitResult, ThrottlingStrategyType};
use crate::dynamic_config::{ConfigListener, ConfigUpdate};
use crate::sleeper::{Sleeper, TokioSleeper};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// Strategy-local failure; the service lifts it into a `RateLimitError` with request context.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ThrottleError {
    #[error("request rejected; retry after {retry_after:?}")]
    Rejected { retry_after: Duration },
    #[error("throttling wait interrupted (retry after {retry_after:?})")]
    Interrupted { retry_after: Duration },
}

/// Shared interrupt flag for in-flight throttling waits.
///
/// Raising the flag wakes every suspended caller with [`ThrottleError::Interrupted`]. The flag
/// stays raised, failing later waits immediately, until [`clear`](Self::clear) is called.
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    flag: Arc<watch::Sender<bool>>,
}

impl Default for InterruptHandle {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { flag: Arc::new(tx) }
    }
}

impl InterruptHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.flag.send_replace(true);
        tracing::warn!("Throttling waits interrupted");
    }

    pub fn clear(&self) {
        self.flag.send_replace(false);
    }

    pub fn is_interrupted(&self) -> bool {
        *self.flag.borrow()
    }

    /// Resolves once the flag is raised.
    pub async fn interrupted(&self) {
        let mut rx = self.flag.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|raised| *raised).await;
    }
}

/// Sleeps that can be cut short by an interrupt.
#[derive(Debug, Clone)]
struct Suspender {
    sleeper: Arc<dyn Sleeper>,
    interrupt: InterruptHandle,
}

impl Suspender {
    async fn suspend(&self, delay: Duration, retry_after: Duration) -> Result<(), ThrottleError> {
        if self.interrupt.is_interrupted() {
            return Err(ThrottleError::Interrupted { retry_after });
        }
        tokio::select! {
            biased;
            _ = self.interrupt.interrupted() => Err(ThrottleError::Interrupted { retry_after }),
            _ = self.sleeper.sleep(delay) => Ok(()),
        }
    }
}

/// Post-decision handling of a rate-limit result.
#[async_trait]
pub trait ThrottlingStrategy: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> ThrottlingStrategyType;

    async fn throttle(&self, result: &RateLimitResult) -> Result<(), ThrottleError>;
}

/// Suspend denied callers for their retry hint.
#[derive(Debug, Clone)]
pub struct DelayThrottling {
    suspender: Suspender,
}

impl DelayThrottling {
    pub fn new(sleeper: Arc<dyn Sleeper>, interrupt: InterruptHandle) -> Self {
        Self { suspender: Suspender { sleeper, interrupt } }
    }
}

#[async_trait]
impl ThrottlingStrategy for DelayThrottling {
    fn kind(&self) -> ThrottlingStrategyType {
        ThrottlingStrategyType::Delay
    }

    async fn throttle(&self, result: &RateLimitResult) -> Result<(), ThrottleError> {
        if result.is_allowed() {
            return Ok(());
        }
        let retry_after = result.retry_after();
        tracing::debug!(delay_ms = retry_after.as_millis() as u64, "Delaying denied request");
        self.suspender.suspend(retry_after, retry_after).await
    }
}

/// Fail denied requests immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct RejectThrottling;

#[async_trait]
impl ThrottlingStrategy for RejectThrottling {
    fn kind(&self) -> ThrottlingStrategyType {
        ThrottlingStrategyType::Reject
    }

    async fn throttle(&self, result: &RateLimitResult) -> Result<(), ThrottleError> {
        if result.is_allowed() {
            return Ok(());
        }
        Err(ThrottleError::Rejected { retry_after: result.retry_after() })
    }
}

/// Suspend denied callers for a delay that grows exponentially with the retry hint.
#[derive(Debug, Clone)]
pub struct ExponentialBackoffThrottling {
    initial_delay: Duration,
    multiplier: f64,
    suspender: Suspender,
}

impl ExponentialBackoffThrottling {
    pub fn new(
        initial_delay: Duration,
        multiplier: f64,
        sleeper: Arc<dyn Sleeper>,
        interrupt: InterruptHandle,
    ) -> Self {
        Self { initial_delay, multiplier, suspender: Suspender { sleeper, interrupt } }
    }

    /// `initial_delay × multiplier^(retry_after in fractional seconds)`, truncated to whole
    /// milliseconds and saturating at `u64::MAX` ms.
    pub fn backoff_delay(&self, retry_after: Duration) -> Duration {
        let exponent = retry_after.as_millis() as f64 / 1_000.0;
        let millis = self.initial_delay.as_millis() as f64 * self.multiplier.powf(exponent);
        if millis.is_finite() {
            // `as` saturates at u64::MAX.
            Duration::from_millis(millis as u64)
        } else {
            Duration::from_millis(u64::MAX)
        }
    }
}

#[async_trait]
impl ThrottlingStrategy for ExponentialBackoffThrottling {
    fn kind(&self) -> ThrottlingStrategyType {
        ThrottlingStrategyType::ExponentialBackoff
    }

    async fn throttle(&self, result: &RateLimitResult) -> Result<(), ThrottleError> {
        if result.is_allowed() {
            return Ok(());
        }
        let retry_after = result.retry_after();
        let delay = self.backoff_delay(retry_after);
        tracing::debug!(
            retry_after_ms = retry_after.as_millis() as u64,
            delay_ms = delay.as_millis() as u64,
            "Backing off denied request"
        );
        self.suspender.suspend(delay, retry_after).await
    }
}

/// Strategy per (endpoint, client tier), built lazily from the live configuration.
#[derive(Debug)]
pub struct ThrottlingStrategies {
    sleeper: Arc<dyn Sleeper>,
    interrupt: InterruptHandle,
    cache: DashMap<(String, ClientType), Arc<dyn ThrottlingStrategy>>,
}

impl Default for ThrottlingStrategies {
    fn default() -> Self {
        Self::new(Arc::new(TokioSleeper), InterruptHandle::new())
    }
}

impl ThrottlingStrategies {
    pub fn new(sleeper: Arc<dyn Sleeper>, interrupt: InterruptHandle) -> Self {
        Self { sleeper, interrupt, cache: DashMap::new() }
    }

    pub fn interrupt_handle(&self) -> &InterruptHandle {
        &self.interrupt
    }

    pub fn create(&self, kind: ThrottlingStrategyType, config: &RateLimitConfig) -> Arc<dyn ThrottlingStrategy> {
        match kind {
            ThrottlingStrategyType::Delay => {
                Arc::new(DelayThrottling::new(self.sleeper.clone(), self.interrupt.clone()))
            }
            ThrottlingStrategyType::Reject => Arc::new(RejectThrottling),
            ThrottlingStrategyType::ExponentialBackoff => Arc::new(ExponentialBackoffThrottling::new(
                config.backoff_initial_delay(),
                config.exponential_backoff_multiplier,
                self.sleeper.clone(),
                self.interrupt.clone(),
            )),
        }
    }

    pub fn strategy_for(
        &self,
        endpoint: &str,
        client_type: ClientType,
        config: &RateLimitConfig,
    ) -> Arc<dyn ThrottlingStrategy> {
        let key = (endpoint.to_string(), client_type);
        if let Some(strategy) = self.cache.get(&key) {
            return strategy.clone();
        }
        self.cache
            .entry(key)
            .or_insert_with(|| {
                let kind = config.throttling_strategy_for(endpoint, client_type);
                tracing::debug!(endpoint, client_type = %client_type, strategy = %kind, "Creating throttling strategy");
                self.create(kind, config)
            })
            .clone()
    }

    /// Drop every cached strategy; the next lookup rebuilds from the configuration it is given.
    pub fn invalidate(&self) {
        self.cache.clear();
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

impl ConfigListener for ThrottlingStrategies {
    fn config_updated(&self, update: &ConfigUpdate) {
        self.invalidate();
        tracing::debug!(version = update.new.version, "Throttling strategy cache invalidated");
    }
}
