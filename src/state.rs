//! Lock-free per-client state structures.
//!
//! Each algorithm keeps one of these per client id. Mutating methods are only called by the
//! algorithm's authoritative path, which runs under the client's exclusive lock in
//! [`ConcurrencyGuard`](crate::guard::ConcurrencyGuard); the `peek`/`projected` readers are pure
//! and back the optimistic path.

pub mod fixed_window;
pub mod leaky_bucket;
pub mod timestamp_queue;
pub mod token_bucket;

pub use fixed_window::WindowCounter;
pub use leaky_bucket::LeakyBucketState;
pub use timestamp_queue::TimestampQueue;
pub use token_bucket::TokenBucketState;
