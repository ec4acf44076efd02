//! Per-client concurrency around an algorithm.
//!
//! Every check first consults the shared circuit breaker, then tries a lock-free estimate and
//! falls back to the client's exclusive lock when the estimate is `Undecided` or a writer
//! interleaved.
//!
//! Each client gets a [`ClientSlot`]: a timed mutex for the write path and a version stamp in
//! the style of a seqlock. Writers bump the stamp to odd on entry and back to even on exit, so
//! an estimate is valid only when the stamp was even before it ran and unchanged after.

use crate::algorithm::{Estimate, RateLimitAlgorithm, RateLimiter};
use crate::circuit_breaker::RateLimitCircuitBreaker;
use crate::clock::Clock;
use crate::domain::{Admission, AlgorithmType, RateLimit, RateLimitResult};
use crate::error::{RateLimitError, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Periodic eviction of idle per-client state.
pub trait IdleSweep: Send + Sync + 'static {
    /// Evict clients idle beyond the inactivity threshold. Returns how many were evicted.
    fn sweep_idle(&self) -> usize;
}

/// Default inactivity after which a client's state is evicted.
pub const DEFAULT_INACTIVITY_THRESHOLD: Duration = Duration::from_secs(60 * 60);

/// Bounded retries for acquiring a client's exclusive lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    retries: u32,
    timeout: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self { retries: 3, timeout: Duration::from_secs(5) }
    }
}

impl LockPolicy {
    pub fn new(retries: u32, timeout: Duration) -> Result<Self> {
        if retries == 0 {
            return Err(RateLimitError::validation("lock retries must be >= 1"));
        }
        if timeout.is_zero() {
            return Err(RateLimitError::validation("lock timeout must be > 0"));
        }
        Ok(Self { retries, timeout })
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Lock, version stamp and last-access time for one client.
#[derive(Debug)]
pub struct ClientSlot {
    lock: Mutex<()>,
    version: AtomicU64,
    last_access: AtomicU64,
}

impl ClientSlot {
    fn new(now: u64) -> Self {
        Self { lock: Mutex::new(()), version: AtomicU64::new(0), last_access: AtomicU64::new(now) }
    }

    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Acquire)
    }

    fn touch(&self, now: u64) {
        self.last_access.fetch_max(now, Ordering::AcqRel);
    }

    /// Stamp to validate against, or `None` while a writer is inside.
    fn begin_read(&self) -> Option<u64> {
        let stamp = self.version.load(Ordering::Acquire);
        (stamp % 2 == 0).then_some(stamp)
    }

    fn validate(&self, stamp: u64) -> bool {
        fence(Ordering::Acquire);
        self.version.load(Ordering::Relaxed) == stamp
    }
}

/// Marks the slot's stamp odd for the lifetime of a write.
struct WriteStamp<'a>(&'a AtomicU64);

impl<'a> WriteStamp<'a> {
    fn enter(version: &'a AtomicU64) -> Self {
        version.fetch_add(1, Ordering::AcqRel);
        Self(version)
    }
}

impl Drop for WriteStamp<'_> {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::Release);
    }
}

/// Wraps an algorithm with the breaker gate, per-client locking and idle eviction.
#[derive(Debug)]
pub struct ConcurrencyGuard<A> {
    algorithm: A,
    breaker: Arc<RateLimitCircuitBreaker>,
    clock: Arc<dyn Clock>,
    slots: DashMap<String, Arc<ClientSlot>>,
    lock_policy: LockPolicy,
    inactivity: Duration,
}

impl<A: RateLimitAlgorithm> ConcurrencyGuard<A> {
    pub fn new(algorithm: A, breaker: Arc<RateLimitCircuitBreaker>, clock: Arc<dyn Clock>) -> Self {
        Self {
            algorithm,
            breaker,
            clock,
            slots: DashMap::new(),
            lock_policy: LockPolicy::default(),
            inactivity: DEFAULT_INACTIVITY_THRESHOLD,
        }
    }

    pub fn with_lock_policy(mut self, lock_policy: LockPolicy) -> Self {
        self.lock_policy = lock_policy;
        self
    }

    pub fn with_inactivity_threshold(mut self, inactivity: Duration) -> Self {
        self.inactivity = inactivity;
        self
    }

    pub fn algorithm(&self) -> &A {
        &self.algorithm
    }

    /// Decide for `rate_limit`, returning the value the caller should persist.
    pub fn check(&self, rate_limit: &RateLimit) -> Result<Admission> {
        rate_limit.validate()?;
        let client_id = rate_limit.client().id();

        if !self.breaker.is_circuit_closed() {
            let retry_after = self.breaker.reset_timeout();
            tracing::warn!(
                client_id,
                retry_after_ms = retry_after.as_millis() as u64,
                "Circuit breaker is open; denying"
            );
            return Ok(Admission::new(RateLimitResult::denied(retry_after), rate_limit.clone()));
        }

        if rate_limit.policy().is_unrestricted() {
            return Ok(Admission::new(RateLimitResult::allowed(), rate_limit.clone()));
        }

        let now = self.clock.now_millis();
        let slot = self.slot(client_id, now);
        let admission = match self.optimistic(&slot, rate_limit, now) {
            Some(admission) => admission,
            None => {
                tracing::trace!(client_id, "Optimistic check undecided; taking write lock");
                self.locked(slot, rate_limit)?
            }
        };

        if admission.is_allowed() {
            self.breaker.record_success();
        } else {
            self.breaker.record_failure();
        }
        tracing::debug!(
            client_id,
            algorithm = %self.algorithm.kind(),
            result = %admission.result,
            "Rate limit check"
        );
        Ok(admission)
    }

    pub fn check_rate_limit(&self, rate_limit: &RateLimit) -> Result<RateLimitResult> {
        self.check(rate_limit).map(|admission| admission.result)
    }

    fn slot(&self, client_id: &str, now: u64) -> Arc<ClientSlot> {
        let slot = match self.slots.get(client_id) {
            Some(slot) => slot.clone(),
            None => self
                .slots
                .entry(client_id.to_string())
                .or_insert_with(|| Arc::new(ClientSlot::new(now)))
                .clone(),
        };
        slot.touch(now);
        slot
    }

    fn optimistic(&self, slot: &ClientSlot, rate_limit: &RateLimit, now: u64) -> Option<Admission> {
        let stamp = slot.begin_read()?;
        let Estimate::Decided(admission) = self.algorithm.decide_optimistic(rate_limit, now) else {
            return None;
        };
        slot.validate(stamp).then_some(admission)
    }

    fn locked(&self, mut slot: Arc<ClientSlot>, rate_limit: &RateLimit) -> Result<Admission> {
        let client_id = rate_limit.client().id();
        let LockPolicy { retries, timeout } = self.lock_policy;
        let mut attempt = 0;
        while attempt < retries {
            let Some(lock) = slot.lock.try_lock_for(timeout) else {
                attempt += 1;
                tracing::warn!(client_id, attempt, retries, "Timed out acquiring client write lock");
                continue;
            };
            if !self.is_live(client_id, &slot) {
                // Swept while this request waited; the client now lives in a fresh slot.
                drop(lock);
                tracing::debug!(client_id, "Client slot was evicted; retrying on the live slot");
                slot = self.slot(client_id, self.clock.now_millis());
                continue;
            }
            let _stamp = WriteStamp::enter(&slot.version);
            let now = self.clock.now_millis();
            return Ok(self.algorithm.decide(rate_limit, now));
        }
        tracing::error!(client_id, retries, "Giving up on client write lock");
        Err(RateLimitError::LockTimeout { client_id: client_id.to_string(), attempts: retries, timeout })
    }

    fn is_live(&self, client_id: &str, slot: &Arc<ClientSlot>) -> bool {
        self.slots.get(client_id).is_some_and(|live| Arc::ptr_eq(live.value(), slot))
    }

    /// Evict clients idle for longer than the inactivity threshold.
    ///
    /// Slots whose lock is currently held are skipped and retried on the next sweep.
    pub fn sweep_idle(&self) -> usize {
        let now = self.clock.now_millis();
        let threshold = u64::try_from(self.inactivity.as_millis()).unwrap_or(u64::MAX);
        let idle: Vec<String> = self
            .slots
            .iter()
            .filter(|entry| now.saturating_sub(entry.value().last_access()) > threshold)
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = 0;
        for client_id in idle {
            // Algorithm state goes while the shard and the client lock are both held, so no
            // request can recreate the client until eviction has finished.
            let removed = self.slots.remove_if(&client_id, |_, slot| {
                if now.saturating_sub(slot.last_access()) <= threshold {
                    return false;
                }
                let Some(_held) = slot.lock.try_lock() else {
                    return false;
                };
                let _stamp = WriteStamp::enter(&slot.version);
                self.algorithm.evict(&client_id);
                true
            });
            if removed.is_some() {
                evicted += 1;
            }
        }
        if evicted > 0 {
            tracing::info!(
                algorithm = %self.algorithm.kind(),
                evicted,
                remaining = self.slots.len(),
                "Cleaned up inactive clients"
            );
        }
        evicted
    }

    pub fn tracked_clients(&self) -> usize {
        self.slots.len()
    }
}

impl<A: RateLimitAlgorithm> RateLimiter for ConcurrencyGuard<A> {
    fn algorithm_type(&self) -> AlgorithmType {
        self.algorithm.kind()
    }

    fn check(&self, rate_limit: &RateLimit) -> Result<Admission> {
        ConcurrencyGuard::check(self, rate_limit)
    }

    fn tracked_clients(&self) -> usize {
        ConcurrencyGuard::tracked_clients(self)
    }
}

impl<A: RateLimitAlgorithm> IdleSweep for ConcurrencyGuard<A> {
    fn sweep_idle(&self) -> usize {
        ConcurrencyGuard::sweep_idle(self)
    }
}

/// Run `sweep_idle` on `target` every `interval` until the target is dropped.
///
/// Must be called from within a tokio runtime.
pub fn spawn_sweeper<S>(target: &Arc<S>, interval: Duration) -> tokio::task::JoinHandle<()>
where
    S: IdleSweep + ?Sized,
{
    let weak: Weak<S> = Arc::downgrade(target);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(target) = weak.upgrade() else {
                tracing::debug!("Sweep target dropped; stopping sweeper");
                break;
            };
            target.sweep_idle();
        }
    })
}
