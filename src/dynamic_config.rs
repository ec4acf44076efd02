//! Live-updatable configuration.
//!
//! [`DynamicConfig`] gives lock-free reads of a shared value through `ArcSwap`.
//! [`ConfigCoordinator`] builds hot reload on top of it: checks hold the shared side of a
//! read/write gate for the whole decision, and an update takes the exclusive side to publish a
//! new snapshot, reconfigure the circuit breaker and invalidate caches as one step. A check
//! therefore sees either the old configuration with the old breaker settings or the new one with
//! the new settings, never a mix.
//!
//! Holding a [`ConfigRead`] while calling [`ConfigCoordinator::update`] on the same thread
//! deadlocks.

use crate::circuit_breaker::RateLimitCircuitBreaker;
use crate::config::RateLimitConfig;
use crate::error::Result;
use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::ops::Deref;
use std::sync::Arc;

/// `DynamicConfig<T>` gives cheap reads and controlled updates for shared config.
#[derive(Debug)]
pub struct DynamicConfig<T> {
    inner: Arc<ArcSwap<T>>,
}

impl<T> Clone for DynamicConfig<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> DynamicConfig<T> {
    /// Create a new `DynamicConfig` with the given initial value.
    pub fn new(value: T) -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
    }

    /// Snapshot the current value (cheap clone of Arc).
    pub fn get(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Replace the value entirely, returning the previous one.
    pub fn set(&self, value: impl Into<Arc<T>>) -> Arc<T> {
        self.inner.swap(value.into())
    }
}

/// A configuration plus the version it was published under.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigSnapshot {
    pub version: u64,
    pub config: Arc<RateLimitConfig>,
}

/// Snapshots on either side of an update.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigUpdate {
    pub old: Arc<ConfigSnapshot>,
    pub new: Arc<ConfigSnapshot>,
}

/// Notified, under the exclusive gate, after a new configuration is published.
pub trait ConfigListener: Send + Sync + std::fmt::Debug {
    fn config_updated(&self, update: &ConfigUpdate);
}

/// Shared read access to the live snapshot. Updates wait until every `ConfigRead` is dropped.
#[derive(Debug)]
pub struct ConfigRead<'a> {
    _gate: RwLockReadGuard<'a, ()>,
    snapshot: Arc<ConfigSnapshot>,
}

impl ConfigRead<'_> {
    pub fn snapshot(&self) -> &Arc<ConfigSnapshot> {
        &self.snapshot
    }
}

impl Deref for ConfigRead<'_> {
    type Target = RateLimitConfig;

    fn deref(&self) -> &RateLimitConfig {
        &self.snapshot.config
    }
}

/// Coordinates hot reload of [`RateLimitConfig`].
#[derive(Debug)]
pub struct ConfigCoordinator {
    live: DynamicConfig<ConfigSnapshot>,
    gate: RwLock<()>,
    breaker: Arc<RateLimitCircuitBreaker>,
    listeners: Mutex<Vec<Arc<dyn ConfigListener>>>,
}

impl ConfigCoordinator {
    /// Validate `config`, publish it as version 1 and align the breaker with it.
    pub fn new(config: RateLimitConfig, breaker: Arc<RateLimitCircuitBreaker>) -> Result<Self> {
        config.validate()?;
        breaker.reconfigure(config.circuit_breaker_config()?);
        Ok(Self {
            live: DynamicConfig::new(ConfigSnapshot { version: 1, config: Arc::new(config) }),
            gate: RwLock::new(()),
            breaker,
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn register(&self, listener: Arc<dyn ConfigListener>) {
        self.listeners.lock().push(listener);
    }

    /// Current snapshot without taking the gate.
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.live.get()
    }

    /// Take the shared side of the gate and load the live snapshot.
    pub fn read(&self) -> ConfigRead<'_> {
        let gate = self.gate.read();
        ConfigRead { _gate: gate, snapshot: self.live.get() }
    }

    pub fn breaker(&self) -> &Arc<RateLimitCircuitBreaker> {
        &self.breaker
    }

    /// Validate and publish `config`.
    ///
    /// Under the exclusive gate: swap the snapshot, reconfigure and reset the breaker, and notify
    /// listeners so they drop cached state built from the old configuration. Nothing changes if
    /// validation fails.
    pub fn update(&self, config: RateLimitConfig) -> Result<ConfigUpdate> {
        config.validate()?;
        let breaker_config = config.circuit_breaker_config()?;

        let _gate = self.gate.write();
        let old = self.live.get();
        let new = Arc::new(ConfigSnapshot { version: old.version + 1, config: Arc::new(config) });
        self.live.set(new.clone());
        self.breaker.reconfigure(breaker_config);

        let update = ConfigUpdate { old, new };
        for listener in self.listeners.lock().iter() {
            listener.config_updated(&update);
        }
        tracing::info!(
            old_version = update.old.version,
            new_version = update.new.version,
            "Rate limit configuration updated"
        );
        Ok(update)
    }
}
