use std::sync::atomic::{AtomicU64, Ordering};

/// Request counter plus the start of the current window.
#[derive(Debug)]
pub struct WindowCounter {
    count: AtomicU64,
    window_start: AtomicU64,
}

impl WindowCounter {
    pub fn new(now: u64) -> Self {
        Self { count: AtomicU64::new(0), window_start: AtomicU64::new(now) }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    pub fn window_start(&self) -> u64 {
        self.window_start.load(Ordering::Acquire)
    }

    pub fn increment_and_get(&self) -> u64 {
        self.count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Undo an increment that pushed the counter past the limit.
    pub fn decrement(&self) {
        let _ = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some(c.saturating_sub(1)));
    }

    /// Start a new window at `now` if the window still starts at `expected_start`.
    ///
    /// Returns true for the single caller that wins the rollover; that caller owns the counter
    /// reset. Everyone else sees the new window already in place.
    pub fn try_roll(&self, expected_start: u64, now: u64, initial_count: u64) -> bool {
        let won = self
            .window_start
            .compare_exchange(expected_start, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.count.store(initial_count, Ordering::Release);
        }
        won
    }
}
