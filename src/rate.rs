/// Configuration seam between the bucket core and its rate variants.
///
/// The core calls these accessors on every reconciliation; variants decide
/// whether the answers are constants ([`FixedRate`]) or re-evaluated
/// suppliers ([`DynamicRate`]). Buckets are generic over the policy, so the
/// variant check is resolved at compile time and nothing is dispatched
/// virtually on the hot path.
pub trait RatePolicy {
    /// Tokens produced per [`rate_period_nanos`](Self::rate_period_nanos).
    fn rate(&self) -> i64;

    /// The period, in nanoseconds, over which [`rate`](Self::rate) tokens
    /// are produced.
    fn rate_period_nanos(&self) -> i64;

    /// Maximum number of stored tokens.
    fn capacity(&self) -> i64;

    /// Token level the bucket must reach before throttled callers are
    /// considered eligible to resume.
    fn target_tokens_after_throttling(&self) -> i64;
}

/// Constant rate configuration: all values are fixed at construction.
#[derive(Debug, Clone, Copy)]
pub struct FixedRate {
    capacity: i64,
    rate: i64,
    rate_period_nanos: i64,
    target_tokens_after_throttling: i64,
}

impl FixedRate {
    pub(crate) fn new(capacity: i64, rate: i64, rate_period_nanos: i64, resolution_nanos: i64) -> Self {
        // the target is one resolution interval's worth of production, with a
        // floor of one token
        let target_tokens_after_throttling = (resolution_nanos * rate / rate_period_nanos).max(1);
        Self {
            capacity,
            rate,
            rate_period_nanos,
            target_tokens_after_throttling,
        }
    }
}

impl RatePolicy for FixedRate {
    #[inline]
    fn rate(&self) -> i64 {
        self.rate
    }

    #[inline]
    fn rate_period_nanos(&self) -> i64 {
        self.rate_period_nanos
    }

    #[inline]
    fn capacity(&self) -> i64 {
        self.capacity
    }

    #[inline]
    fn target_tokens_after_throttling(&self) -> i64 {
        self.target_tokens_after_throttling
    }
}

/// Rate configuration evaluated on demand.
///
/// The rate and rate period are supplier closures re-evaluated on every
/// access; capacity and the post-throttling target are derived from the
/// current rate through the configured factors. When the suppliers change
/// their answers between reconciliations, any uncommitted interval is
/// integrated with the rate effective at the moment of reconciliation, not
/// the rate at the moment of consumption. That is a deliberate trade of
/// perfect integration for lock-freedom.
pub struct DynamicRate {
    rate_fn: Box<dyn Fn() -> i64 + Send + Sync>,
    rate_period_fn: Box<dyn Fn() -> i64 + Send + Sync>,
    capacity_factor: f64,
    target_fill_factor: f64,
}

impl DynamicRate {
    pub(crate) fn new(
        rate_fn: Box<dyn Fn() -> i64 + Send + Sync>,
        rate_period_fn: Box<dyn Fn() -> i64 + Send + Sync>,
        capacity_factor: f64,
        target_fill_factor: f64,
    ) -> Self {
        Self {
            rate_fn,
            rate_period_fn,
            capacity_factor,
            target_fill_factor,
        }
    }
}

impl RatePolicy for DynamicRate {
    #[inline]
    fn rate(&self) -> i64 {
        (self.rate_fn)()
    }

    #[inline]
    fn rate_period_nanos(&self) -> i64 {
        (self.rate_period_fn)()
    }

    #[inline]
    fn capacity(&self) -> i64 {
        let rate = self.rate();
        if self.capacity_factor == 1.0 {
            rate
        } else {
            (rate as f64 * self.capacity_factor) as i64
        }
    }

    #[inline]
    fn target_tokens_after_throttling(&self) -> i64 {
        (self.rate() as f64 * self.target_fill_factor) as i64
    }
}
