//! An eventually-consistent token bucket core for building high-throughput
//! rate limiters.
//!
//! [`AsyncTokenBucket`] answers two questions: "subtract N tokens" on the
//! hot path, without any single contended memory location, and "how long
//! must a throttled caller wait" on the cold path, from a coherent view of
//! state. See the type-level documentation for the usage flow, and
//! [`GranularClock`] for taking the monotonic-time syscall off the hot path.

mod adder;
mod bucket;
mod builder;
mod clock;
mod error;
mod rate;

pub use adder::ShardedAdder;
pub use bucket::AsyncTokenBucket;
pub use builder::{
    DynamicRateBuilder, FixedRateBuilder, use_consistent_tokens_view,
    use_eventually_consistent_tokens_view,
};
#[cfg(feature = "quanta")]
pub use clock::QuantaClock;
pub use clock::{ClockSource, GranularClock, ManualClock, StdClock};
pub use error::BuildError;
pub use rate::{DynamicRate, FixedRate, RatePolicy};
