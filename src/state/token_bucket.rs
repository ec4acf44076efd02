use std::sync::atomic::{AtomicU64, Ordering};

/// Token count plus the timestamp refill progress is measured from.
///
/// Refill accrues whole tokens only. The refill timestamp advances by exactly the time those
/// tokens account for, so fractional progress carries over to the next refill. The count is not
/// clamped to any capacity: a long idle period accrues tokens without bound.
#[derive(Debug)]
pub struct TokenBucketState {
    tokens: AtomicU64,
    last_refill: AtomicU64,
}

/// Whole tokens accrued over `elapsed` ms and the time they account for.
fn accrual(elapsed: u64, rate: u32, window_millis: u64) -> (u64, u64) {
    let window = u128::from(window_millis.max(1));
    let rate = u128::from(rate.max(1));
    let tokens = u128::from(elapsed) * rate / window;
    let consumed = tokens * window / rate;
    (saturate(tokens), saturate(consumed))
}

fn saturate(v: u128) -> u64 {
    u64::try_from(v).unwrap_or(u64::MAX)
}

impl TokenBucketState {
    pub fn new(initial_tokens: u64, now: u64) -> Self {
        Self { tokens: AtomicU64::new(initial_tokens), last_refill: AtomicU64::new(now) }
    }

    pub fn tokens(&self) -> u64 {
        self.tokens.load(Ordering::Acquire)
    }

    pub fn last_refill(&self) -> u64 {
        self.last_refill.load(Ordering::Acquire)
    }

    /// Tokens that would be available at `now`, without touching state.
    pub fn peek(&self, now: u64, rate: u32, window_millis: u64) -> u64 {
        let elapsed = now.saturating_sub(self.last_refill());
        let (accrued, _) = accrual(elapsed, rate, window_millis);
        self.tokens().saturating_add(accrued)
    }

    /// Credit the tokens accrued since the last refill. Returns how many were added.
    pub fn refill(&self, now: u64, rate: u32, window_millis: u64) -> u64 {
        let last = self.last_refill();
        let (accrued, consumed) = accrual(now.saturating_sub(last), rate, window_millis);
        if accrued > 0 {
            self.last_refill.store(last.saturating_add(consumed), Ordering::Release);
            self.tokens.fetch_add(accrued, Ordering::AcqRel);
        }
        accrued
    }

    /// Take one token if any are left.
    pub fn try_consume(&self) -> bool {
        self.tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| t.checked_sub(1))
            .is_ok()
    }

    /// Time until the next whole token accrues at `now`.
    pub fn time_to_next_token(&self, now: u64, rate: u32, window_millis: u64) -> u64 {
        let window = u128::from(window_millis.max(1));
        let rate = u128::from(rate.max(1));
        let progress = u128::from(now.saturating_sub(self.last_refill()));
        // ceil(window / rate) is the time one token takes.
        let per_token = (window + rate - 1) / rate;
        saturate(per_token.saturating_sub(progress).max(1))
    }
}
