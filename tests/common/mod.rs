#![allow(dead_code)]

use std::io;
use std::sync::Arc;
use std::time::Duration;
use turnstile::clock::ManualClock;
use turnstile::{
    build_rate_limiter, AlgorithmType, Client, ClientType, Policy, RateLimit, RateLimitCircuitBreaker,
    RateLimitConfig, RateLimiter,
};

/// A breaker that will not open during ordinary test traffic.
pub fn lenient_breaker() -> Arc<RateLimitCircuitBreaker> {
    Arc::new(RateLimitCircuitBreaker::new(1_000_000, Duration::from_secs(30)).expect("valid breaker"))
}

pub fn limiter(kind: AlgorithmType, config: &RateLimitConfig, clock: &ManualClock) -> Arc<dyn RateLimiter> {
    build_rate_limiter(kind, config, lenient_breaker(), Arc::new(clock.clone())).expect("limiter builds")
}

pub fn rate_limit(client_id: &str, requests_per_second: u32) -> RateLimit {
    RateLimit::new(
        Client::new(client_id, ClientType::Standard),
        Policy::limited(requests_per_second).expect("positive rate"),
        0,
    )
}

/// Shared in-memory sink for captured log output.
#[derive(Clone, Default)]
pub struct LogBuffer(Arc<parking_lot::Mutex<Vec<u8>>>);

impl LogBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
