use arc_swap::ArcSwap;
use std::collections::VecDeque;

/// FIFO of admission timestamps, oldest first.
///
/// Readers load an immutable snapshot; writers publish a new copy through `rcu`. Writers for one
/// client are serialized by the guard, so `rcu` rarely retries.
///
/// Every `push` and every effective `evict_expired` copies the deque, so a write costs O(live
/// entries). Admissions stop once `limit` entries are live, which bounds that at the policy's
/// per-window limit.
#[derive(Debug, Default)]
pub struct TimestampQueue {
    entries: ArcSwap<VecDeque<u64>>,
}

impl TimestampQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.load().is_empty()
    }

    pub fn oldest(&self) -> Option<u64> {
        self.entries.load().front().copied()
    }

    /// Drop every timestamp `<= cutoff`. Returns how many were removed.
    pub fn evict_expired(&self, cutoff: u64) -> usize {
        let current = self.entries.load();
        let stale = current.iter().take_while(|&&ts| ts <= cutoff).count();
        if stale == 0 {
            return 0;
        }
        self.entries.rcu(|entries| {
            let mut next = VecDeque::clone(entries);
            while next.front().is_some_and(|&ts| ts <= cutoff) {
                next.pop_front();
            }
            next
        });
        stale
    }

    pub fn push(&self, timestamp: u64) {
        self.entries.rcu(|entries| {
            let mut next = VecDeque::clone(entries);
            next.push_back(timestamp);
            next
        });
    }

    /// Live entries (`> cutoff`) and the oldest of them, without touching state.
    pub fn live_after(&self, cutoff: u64) -> (usize, Option<u64>) {
        let entries = self.entries.load();
        let mut live = entries.iter().skip_while(|&&ts| ts <= cutoff);
        let oldest = live.next().copied();
        let count = oldest.map_or(0, |_| 1 + live.count());
        (count, oldest)
    }
}
