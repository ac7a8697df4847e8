use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use crate::bucket::AsyncTokenBucket;
use crate::clock::{ClockSource, StdClock};
use crate::error::BuildError;
use crate::rate::{DynamicRate, FixedRate};

pub(crate) const ONE_SECOND_NANOS: i64 = 1_000_000_000;

/// The default resolution batches balance updates into 16 ms intervals,
/// which keeps writers off a shared CAS loop at high call rates.
const DEFAULT_RESOLUTION_NANOS: i64 = 16_000_000;

static DEFAULT_RESOLUTION: AtomicI64 = AtomicI64::new(DEFAULT_RESOLUTION_NANOS);

/// Switches the process-wide default resolution to zero, so every bucket
/// built afterwards (without an explicit resolution) updates its balance on
/// every call.
///
/// Intended for deterministic tests only; the eventual consistency this
/// disables is the point of the design. Prefer configuring
/// [`resolution`](FixedRateBuilder::resolution) per bucket. Restore with
/// [`use_eventually_consistent_tokens_view`].
pub fn use_consistent_tokens_view() {
    DEFAULT_RESOLUTION.store(0, Ordering::Release);
}

/// Restores the process-wide default resolution of 16 ms.
pub fn use_eventually_consistent_tokens_view() {
    DEFAULT_RESOLUTION.store(DEFAULT_RESOLUTION_NANOS, Ordering::Release);
}

fn default_resolution_nanos() -> i64 {
    DEFAULT_RESOLUTION.load(Ordering::Acquire)
}

/// Builder for buckets with a constant rate.
///
/// `rate` is required; capacity and the initial balance default to one
/// period's worth of production.
///
/// # Examples
///
/// ```rust
/// use virta::{AsyncTokenBucket, BuildError};
///
/// let err = AsyncTokenBucket::builder().build().unwrap_err();
/// assert_eq!(err, BuildError::MissingRate);
/// ```
pub struct FixedRateBuilder<C = StdClock> {
    rate: Option<i64>,
    capacity: Option<i64>,
    initial_tokens: Option<i64>,
    rate_period_nanos: i64,
    resolution_nanos: Option<i64>,
    clock: C,
}

impl FixedRateBuilder<StdClock> {
    pub fn new() -> Self {
        Self {
            rate: None,
            capacity: None,
            initial_tokens: None,
            rate_period_nanos: ONE_SECOND_NANOS,
            resolution_nanos: None,
            clock: StdClock::default(),
        }
    }
}

impl Default for FixedRateBuilder<StdClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> FixedRateBuilder<C> {
    /// Tokens produced per rate period. Required.
    pub fn rate(mut self, rate: i64) -> Self {
        self.rate = Some(rate);
        self
    }

    /// Maximum number of stored tokens. Defaults to `rate`.
    pub fn capacity(mut self, capacity: i64) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Tokens at construction, clamped to capacity. Defaults to `rate`.
    pub fn initial_tokens(mut self, initial_tokens: i64) -> Self {
        self.initial_tokens = Some(initial_tokens);
        self
    }

    /// Period over which `rate` tokens are produced. Defaults to one second.
    pub fn rate_period(mut self, rate_period: Duration) -> Self {
        self.rate_period_nanos = rate_period.as_nanos() as i64;
        self
    }

    /// Balance-update interval. `Duration::ZERO` disables batching so every
    /// call updates the balance. Defaults to the process-wide default of
    /// 16 ms.
    pub fn resolution(mut self, resolution: Duration) -> Self {
        self.resolution_nanos = Some(resolution.as_nanos() as i64);
        self
    }

    /// Replaces the clock source.
    pub fn clock<C2: ClockSource>(self, clock: C2) -> FixedRateBuilder<C2> {
        FixedRateBuilder {
            rate: self.rate,
            capacity: self.capacity,
            initial_tokens: self.initial_tokens,
            rate_period_nanos: self.rate_period_nanos,
            resolution_nanos: self.resolution_nanos,
            clock,
        }
    }
}

impl<C: ClockSource> FixedRateBuilder<C> {
    /// Validates the configuration and constructs the bucket.
    pub fn build(self) -> Result<AsyncTokenBucket<FixedRate, C>, BuildError> {
        let rate = self.rate.ok_or(BuildError::MissingRate)?;
        if rate <= 0 {
            return Err(BuildError::InvalidRate(rate));
        }
        if self.rate_period_nanos <= 0 {
            return Err(BuildError::InvalidRatePeriod(self.rate_period_nanos));
        }
        let capacity = self.capacity.unwrap_or(rate);
        if capacity <= 0 {
            return Err(BuildError::InvalidCapacity(capacity));
        }
        let initial_tokens = self.initial_tokens.unwrap_or(rate);
        let resolution_nanos = self.resolution_nanos.unwrap_or_else(default_resolution_nanos);
        let policy = FixedRate::new(capacity, rate, self.rate_period_nanos, resolution_nanos);
        Ok(AsyncTokenBucket::from_parts(
            policy,
            self.clock,
            resolution_nanos,
            initial_tokens,
        ))
    }
}

/// Builder for buckets whose rate is evaluated on demand.
///
/// A rate supplier is required. Capacity, initial balance, and the
/// post-throttling target are expressed as factors of the current rate.
pub struct DynamicRateBuilder<C = StdClock> {
    rate_fn: Option<Box<dyn Fn() -> i64 + Send + Sync>>,
    rate_period_fn: Option<Box<dyn Fn() -> i64 + Send + Sync>>,
    capacity_factor: f64,
    initial_fill_factor: f64,
    target_fill_factor: f64,
    resolution_nanos: Option<i64>,
    clock: C,
}

impl DynamicRateBuilder<StdClock> {
    pub fn new() -> Self {
        Self {
            rate_fn: None,
            rate_period_fn: None,
            capacity_factor: 1.0,
            initial_fill_factor: 1.0,
            target_fill_factor: 0.01,
            resolution_nanos: None,
            clock: StdClock::default(),
        }
    }
}

impl Default for DynamicRateBuilder<StdClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> DynamicRateBuilder<C> {
    /// Supplier of the current rate. Required; must return positive values.
    pub fn rate_fn<F>(mut self, rate_fn: F) -> Self
    where
        F: Fn() -> i64 + Send + Sync + 'static,
    {
        self.rate_fn = Some(Box::new(rate_fn));
        self
    }

    /// Supplier of the current rate period in nanoseconds. Defaults to a
    /// constant one second; must return positive values.
    pub fn rate_period_fn<F>(mut self, rate_period_fn: F) -> Self
    where
        F: Fn() -> i64 + Send + Sync + 'static,
    {
        self.rate_period_fn = Some(Box::new(rate_period_fn));
        self
    }

    /// `capacity = rate × factor`. Defaults to 1.0.
    pub fn capacity_factor(mut self, capacity_factor: f64) -> Self {
        self.capacity_factor = capacity_factor;
        self
    }

    /// `initial tokens = rate × factor`. Defaults to 1.0.
    pub fn initial_fill_factor(mut self, initial_fill_factor: f64) -> Self {
        self.initial_fill_factor = initial_fill_factor;
        self
    }

    /// `target after throttling = rate × factor`. Defaults to 0.01.
    pub fn target_fill_factor(mut self, target_fill_factor: f64) -> Self {
        self.target_fill_factor = target_fill_factor;
        self
    }

    /// Balance-update interval, as for
    /// [`FixedRateBuilder::resolution`].
    pub fn resolution(mut self, resolution: Duration) -> Self {
        self.resolution_nanos = Some(resolution.as_nanos() as i64);
        self
    }

    /// Replaces the clock source.
    pub fn clock<C2: ClockSource>(self, clock: C2) -> DynamicRateBuilder<C2> {
        DynamicRateBuilder {
            rate_fn: self.rate_fn,
            rate_period_fn: self.rate_period_fn,
            capacity_factor: self.capacity_factor,
            initial_fill_factor: self.initial_fill_factor,
            target_fill_factor: self.target_fill_factor,
            resolution_nanos: self.resolution_nanos,
            clock,
        }
    }
}

impl<C: ClockSource> DynamicRateBuilder<C> {
    /// Validates the configuration and constructs the bucket.
    pub fn build(self) -> Result<AsyncTokenBucket<DynamicRate, C>, BuildError> {
        let rate_fn = self.rate_fn.ok_or(BuildError::MissingRate)?;
        if self.capacity_factor <= 0.0 {
            return Err(BuildError::InvalidFactor {
                name: "capacity_factor",
                value: self.capacity_factor,
            });
        }
        if self.initial_fill_factor < 0.0 {
            return Err(BuildError::InvalidFactor {
                name: "initial_fill_factor",
                value: self.initial_fill_factor,
            });
        }
        if self.target_fill_factor <= 0.0 {
            return Err(BuildError::InvalidFactor {
                name: "target_fill_factor",
                value: self.target_fill_factor,
            });
        }
        let rate_period_fn = self
            .rate_period_fn
            .unwrap_or_else(|| Box::new(|| ONE_SECOND_NANOS));
        let initial_tokens = (rate_fn() as f64 * self.initial_fill_factor) as i64;
        let resolution_nanos = self.resolution_nanos.unwrap_or_else(default_resolution_nanos);
        let policy = DynamicRate::new(
            rate_fn,
            rate_period_fn,
            self.capacity_factor,
            self.target_fill_factor,
        );
        Ok(AsyncTokenBucket::from_parts(
            policy,
            self.clock,
            resolution_nanos,
            initial_tokens,
        ))
    }
}
