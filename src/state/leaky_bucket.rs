use std::sync::atomic::{AtomicU64, Ordering};

/// Water level plus the timestamp draining is measured from.
///
/// The bucket leaks `rate` units per second. Only whole units drain; the drip timestamp advances
/// by the time the drained units account for. An empty bucket restarts its drip clock.
#[derive(Debug)]
pub struct LeakyBucketState {
    level: AtomicU64,
    last_drip: AtomicU64,
    capacity: u64,
}

fn drained(elapsed: u64, rate: u32) -> (u64, u64) {
    let rate = u128::from(rate.max(1));
    let units = u128::from(elapsed) * rate / 1_000;
    let consumed = units * 1_000 / rate;
    (
        u64::try_from(units).unwrap_or(u64::MAX),
        u64::try_from(consumed).unwrap_or(u64::MAX),
    )
}

impl LeakyBucketState {
    pub fn new(capacity: u64, now: u64) -> Self {
        Self { level: AtomicU64::new(0), last_drip: AtomicU64::new(now), capacity }
    }

    pub fn level(&self) -> u64 {
        self.level.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn last_drip(&self) -> u64 {
        self.last_drip.load(Ordering::Acquire)
    }

    /// Level the bucket would have after draining to `now`, without touching state.
    pub fn projected_level(&self, now: u64, rate: u32) -> u64 {
        let (units, _) = drained(now.saturating_sub(self.last_drip()), rate);
        self.level().saturating_sub(units)
    }

    /// Drain to `now` and return the new level.
    pub fn drain(&self, now: u64, rate: u32) -> u64 {
        let last = self.last_drip();
        let (units, consumed) = drained(now.saturating_sub(last), rate);
        let level = self.level().saturating_sub(units);
        self.level.store(level, Ordering::Release);
        if level == 0 {
            self.last_drip.store(now.max(last), Ordering::Release);
        } else if units > 0 {
            self.last_drip.store(last.saturating_add(consumed), Ordering::Release);
        }
        level
    }

    /// Add one unit if there is room. Call after [`drain`](Self::drain).
    pub fn try_fill(&self) -> bool {
        let capacity = self.capacity;
        self.level
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |l| (l < capacity).then_some(l + 1))
            .is_ok()
    }

    /// Time for enough water to leak that one more unit fits.
    pub fn retry_after_millis(&self, level: u64, rate: u32) -> u64 {
        let excess = u128::from(level.saturating_sub(self.capacity).saturating_add(1));
        let rate = u128::from(rate.max(1));
        u64::try_from((excess * 1_000 + rate - 1) / rate).unwrap_or(u64::MAX)
    }
}
