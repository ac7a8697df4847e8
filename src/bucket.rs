use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use crossbeam_utils::CachePadded;
use likely_stable::unlikely;

use crate::adder::ShardedAdder;
use crate::builder::{DynamicRateBuilder, FixedRateBuilder};
use crate::clock::{ClockSource, StdClock};
use crate::rate::{FixedRate, RatePolicy};

/// An eventually-consistent token bucket built for highly concurrent use.
///
/// The bucket is a sophisticated shared counter, not a scheduler: it never
/// blocks, sleeps, or owns threads. Consumption on the hot path is recorded
/// in a [`ShardedAdder`] and folded into the authoritative balance at most
/// once per resolution interval, by whichever caller wins a compare-and-swap
/// election on the current tick. That keeps the hot path free of any single
/// contended memory location while the cold path can still force a coherent
/// view on demand.
///
/// Main usage flow:
///
/// 1. Consume through [`consume_tokens`](Self::consume_tokens) or
///    [`consume_tokens_and_check`](Self::consume_tokens_and_check).
/// 2. A `false` answer from the check methods indicates a need for
///    throttling; ask [`throttling_duration`](Self::throttling_duration) for
///    the pause length.
/// 3. After the pause, re-check with
///    [`contains_tokens`](Self::contains_tokens) (or the consistent variant)
///    and either resume or keep throttling.
///
/// Ordering the waiting callers, sleeping, and unthrottling fairly are the
/// responsibility of the layer above.
///
/// For read-heavy workloads pair the bucket with a
/// [`GranularClock`](crate::GranularClock), which removes the monotonic-time
/// syscall from the hot path.
///
/// # Examples
///
/// ```rust
/// use virta::AsyncTokenBucket;
///
/// let bucket = AsyncTokenBucket::builder()
///     .rate(1000)
///     .capacity(2000)
///     .build()
///     .unwrap();
///
/// bucket.consume_tokens(100);
/// if !bucket.contains_tokens() {
///     let _pause = bucket.throttling_duration();
///     // hand the pause to the scheduling layer, then re-check
/// }
/// ```
pub struct AsyncTokenBucket<R = FixedRate, C = StdClock> {
    /// Eventually consistent balance; authoritative only at reconciliation
    /// commits. Wrapping arithmetic is intentional.
    tokens: CachePadded<AtomicI64>,
    /// Monotonic timestamp of the last balance update. Zero means the
    /// balance has never been updated.
    last_nanos: AtomicI64,
    /// Tick index of the last balance update; the election key.
    last_increment: AtomicI64,
    /// Sub-tick nanoseconds carried into the next update so rounding never
    /// loses production over time.
    remainder_nanos: AtomicI64,
    /// Consumption recorded on the fast path, drained at the next update.
    pending_consumed: ShardedAdder,
    resolution_nanos: i64,
    policy: R,
    clock: C,
}

impl<R: RatePolicy, C> std::fmt::Debug for AsyncTokenBucket<R, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncTokenBucket")
            .field("tokens", &self.tokens.load(Ordering::Relaxed))
            .field("capacity", &self.policy.capacity())
            .field("rate", &self.policy.rate())
            .field("resolution_nanos", &self.resolution_nanos)
            .finish_non_exhaustive()
    }
}

impl AsyncTokenBucket {
    /// Returns a builder for a bucket with a constant rate.
    pub fn builder() -> FixedRateBuilder<StdClock> {
        FixedRateBuilder::new()
    }

    /// Returns a builder for a bucket whose rate is re-evaluated on demand.
    pub fn dynamic_builder() -> DynamicRateBuilder<StdClock> {
        DynamicRateBuilder::new()
    }
}

impl<R: RatePolicy, C: ClockSource> AsyncTokenBucket<R, C> {
    pub(crate) fn from_parts(policy: R, clock: C, resolution_nanos: i64, initial_tokens: i64) -> Self {
        let bucket = Self {
            tokens: CachePadded::new(AtomicI64::new(initial_tokens)),
            last_nanos: AtomicI64::new(0),
            last_increment: AtomicI64::new(0),
            remainder_nanos: AtomicI64::new(0),
            pending_consumed: ShardedAdder::new(),
            resolution_nanos,
            policy,
            clock,
        };
        // record the construction instant and clamp the initial balance
        bucket.tokens_balance(false);
        bucket
    }

    /// Eventually consume tokens from the bucket.
    ///
    /// The balance is updated at most once per resolution interval; between
    /// updates the consumption is buffered in the pending-consumption adder.
    #[inline]
    pub fn consume_tokens(&self, amount: u64) {
        let _ = self.consume_and_maybe_update(amount, false);
    }

    /// Consumes tokens and reports whether the bucket likely still holds
    /// tokens.
    ///
    /// When this call did not update the balance, the answer is a best guess
    /// computed from the current balance minus `amount`, knowingly ignoring
    /// other callers' pending consumption. Definitive answers are available
    /// from [`contains_tokens_consistent`](Self::contains_tokens_consistent)
    /// or [`throttling_duration`](Self::throttling_duration).
    #[inline]
    pub fn consume_tokens_and_check(&self, amount: u64) -> bool {
        match self.consume_and_maybe_update(amount, false) {
            Some(current_tokens) => current_tokens > 0,
            None => {
                self.tokens
                    .load(Ordering::Acquire)
                    .wrapping_sub(amount as i64)
                    > 0
            }
        }
    }

    /// Returns the current balance, updating it first if the resolution
    /// interval has passed since the last update. May be stale by up to one
    /// resolution interval.
    pub fn tokens(&self) -> i64 {
        self.tokens_balance(false)
    }

    /// Returns the balance after a forced update that drains all pending
    /// consumption. Not intended for the hot path.
    pub fn consistent_tokens(&self) -> i64 {
        self.tokens_balance(true)
    }

    /// Whether the bucket holds tokens. Eventually consistent, like
    /// [`tokens`](Self::tokens).
    pub fn contains_tokens(&self) -> bool {
        self.tokens_balance(false) > 0
    }

    /// Whether the bucket holds tokens, answered from a forced update.
    pub fn contains_tokens_consistent(&self) -> bool {
        self.tokens_balance(true) > 0
    }

    /// The pause needed before the bucket again holds the configured target
    /// amount of tokens, or zero when it already does.
    ///
    /// The target is deliberately far below capacity; waiting for a full
    /// bucket would unthrottle callers in bursts. Always performs a forced
    /// update, so this belongs on the cold path.
    pub fn throttling_duration(&self) -> Duration {
        let current_tokens = self
            .consume_and_maybe_update(0, true)
            .expect("forced update always refreshes the balance");
        let need_tokens = self.policy.target_tokens_after_throttling() - current_tokens;
        if need_tokens <= 0 {
            return Duration::ZERO;
        }
        let pause_nanos = need_tokens * self.policy.rate_period_nanos() / self.policy.rate();
        Duration::from_nanos(pause_nanos as u64)
    }

    /// Maximum number of stored tokens.
    pub fn capacity(&self) -> i64 {
        self.policy.capacity()
    }

    /// Tokens produced per rate period.
    pub fn rate(&self) -> i64 {
        self.policy.rate()
    }

    fn tokens_balance(&self, force_update: bool) -> i64 {
        self.consume_and_maybe_update(0, force_update)
            .unwrap_or_else(|| self.tokens.load(Ordering::Acquire))
    }

    /// Consumes tokens and possibly updates the balance. Returns the
    /// post-update balance, or `None` when this call took the fast path and
    /// the current balance is unknown.
    fn consume_and_maybe_update(&self, amount: u64, force_update: bool) -> Option<i64> {
        let current_nanos = self.clock.nanos(force_update);
        if unlikely(self.should_update_immediately(current_nanos, force_update)) {
            let new_tokens = self.new_tokens_since_last_update(current_nanos);
            // fold this call's consumption together with everything buffered
            // on the fast path since the previous update
            let consumed = (amount as i64).wrapping_add(self.pending_consumed.sum_and_reset());
            Some(self.commit(new_tokens, consumed))
        } else {
            if amount > 0 {
                self.pending_consumed.add(amount as i64);
            }
            None
        }
    }

    /// The election: at most one caller per tick gets a `true` answer, aside
    /// from forced updates and the strict zero-resolution mode.
    fn should_update_immediately(&self, current_nanos: i64, force_update: bool) -> bool {
        let current_increment = if self.resolution_nanos != 0 {
            current_nanos / self.resolution_nanos
        } else {
            0
        };
        let last_increment = self.last_increment.load(Ordering::Acquire);
        current_increment == 0
            || (current_increment > last_increment
                && self
                    .last_increment
                    .compare_exchange(
                        last_increment,
                        current_increment,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    )
                    .is_ok())
            || force_update
    }

    /// Tokens produced since the last update, carrying the sub-token
    /// remainder forward so rounding error never accumulates.
    fn new_tokens_since_last_update(&self, current_nanos: i64) -> i64 {
        let previous_last_nanos = self.last_nanos.swap(current_nanos, Ordering::AcqRel);
        if previous_last_nanos == 0 {
            return 0;
        }
        let duration_nanos = current_nanos - previous_last_nanos
            + self.remainder_nanos.swap(0, Ordering::AcqRel);
        let rate = self.policy.rate();
        let rate_period_nanos = self.policy.rate_period_nanos();
        let new_tokens = duration_nanos * rate / rate_period_nanos;
        let remainder_nanos = duration_nanos - new_tokens * rate_period_nanos / rate;
        if remainder_nanos > 0 {
            // additive so a racing reset cannot drop the residue
            self.remainder_nanos
                .fetch_add(remainder_nanos, Ordering::AcqRel);
        }
        new_tokens
    }

    /// New tokens are added and clamped to capacity before consumption is
    /// subtracted, so one oversized request can drive the balance negative
    /// but never forfeits production accrued since the last update.
    fn commit(&self, new_tokens: i64, consumed: i64) -> i64 {
        let capacity = self.policy.capacity();
        let mut current = self.tokens.load(Ordering::Acquire);
        loop {
            let next = current
                .wrapping_add(new_tokens)
                .min(capacity)
                .wrapping_sub(consumed);
            match self.tokens.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(observed) => current = observed,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::time::Duration;

    use crate::clock::ManualClock;

    use super::*;

    const SECOND_NANOS: i64 = 1_000_000_000;

    fn manual_clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(100 * SECOND_NANOS))
    }

    fn strict_bucket(clock: &Arc<ManualClock>) -> AsyncTokenBucket<FixedRate, Arc<ManualClock>> {
        AsyncTokenBucket::builder()
            .rate(10)
            .capacity(100)
            .initial_tokens(0)
            .resolution(Duration::ZERO)
            .clock(Arc::clone(clock))
            .build()
            .unwrap()
    }

    #[test]
    fn adds_tokens_with_configured_rate() {
        let clock = manual_clock();
        let bucket = strict_bucket(&clock);
        clock.advance(Duration::from_secs(5));
        assert_eq!(bucket.tokens(), 50);
        clock.advance(Duration::from_secs(1));
        assert_eq!(bucket.tokens(), 60);
        clock.advance(Duration::from_secs(4));
        assert_eq!(bucket.tokens(), 100);

        // no matter how long the pause, tokens do not go above capacity
        clock.advance(Duration::from_secs(5));
        assert_eq!(bucket.tokens(), 100);

        // consume everything, then wait one period and check replenishment
        bucket.consume_tokens(100);
        assert_eq!(bucket.consistent_tokens(), 0);
        clock.advance(Duration::from_secs(1));
        assert_eq!(bucket.tokens(), 10);
    }

    #[test]
    fn calculates_throttling_duration() {
        let clock = manual_clock();
        let bucket = strict_bucket(&clock);
        clock.advance(Duration::from_secs(5));
        bucket.consume_tokens(100);
        assert_eq!(bucket.tokens(), -50);
        // 51 missing tokens at 10 tokens/s
        assert_eq!(bucket.throttling_duration(), Duration::from_millis(5100));
    }

    #[test]
    fn throttling_duration_is_zero_at_or_above_the_target() {
        let clock = manual_clock();
        let bucket = strict_bucket(&clock);
        clock.advance(Duration::from_secs(1));
        assert_eq!(bucket.throttling_duration(), Duration::ZERO);
    }

    #[test]
    fn supports_fractional_amounts_when_updating() {
        let clock = manual_clock();
        let bucket = strict_bucket(&clock);
        clock.advance(Duration::from_millis(100));
        assert_eq!(bucket.tokens(), 1);
    }

    #[test]
    fn carries_leftover_nanos_across_updates() {
        let clock = manual_clock();
        let bucket = strict_bucket(&clock);
        for _ in 0..150 {
            clock.advance(Duration::from_millis(1));
        }
        assert_eq!(bucket.tokens(), 1);
        clock.advance(Duration::from_millis(150));
        assert_eq!(bucket.tokens(), 3);
    }

    #[test]
    fn carries_leftover_nanos_across_many_small_updates() {
        let clock = manual_clock();
        let bucket = strict_bucket(&clock);
        for _ in 0..150 {
            clock.advance(Duration::from_millis(1));
            bucket.consume_tokens(0);
        }
        assert_eq!(bucket.tokens(), 1);
    }

    #[test]
    fn reconciles_once_per_resolution_interval() {
        let clock = manual_clock();
        let bucket = AsyncTokenBucket::builder()
            .rate(1000)
            .capacity(1_000_000)
            .initial_tokens(0)
            .resolution(Duration::from_millis(16))
            .clock(Arc::clone(&clock))
            .build()
            .unwrap();
        // same tick as construction: buffered, balance untouched
        bucket.consume_tokens(7);
        assert_eq!(bucket.tokens(), 0);
        // next tick: this call wins the election and folds everything in
        clock.advance(Duration::from_millis(16));
        bucket.consume_tokens(3);
        assert_eq!(bucket.tokens(), 6);
    }

    #[test]
    fn check_result_is_a_best_guess_on_the_fast_path() {
        let clock = manual_clock();
        let bucket = AsyncTokenBucket::builder()
            .rate(10)
            .initial_tokens(10)
            .resolution(Duration::from_millis(16))
            .clock(Arc::clone(&clock))
            .build()
            .unwrap();
        // both calls land on the fast path; each other's pending consumption
        // is ignored on purpose
        assert!(bucket.consume_tokens_and_check(5));
        assert!(bucket.consume_tokens_and_check(5));
        // the forced update drains the buffered consumption
        assert!(!bucket.contains_tokens_consistent());
    }

    #[test]
    fn strict_mode_drains_pending_consumption_on_every_call() {
        let clock = manual_clock();
        let bucket = strict_bucket(&clock);
        bucket.consume_tokens(3);
        assert_eq!(bucket.pending_consumed.sum(), 0);
        assert_eq!(bucket.consistent_tokens(), -3);
    }

    #[test]
    fn conserves_tokens_under_concurrent_consumption() {
        let clock = manual_clock();
        let bucket = AsyncTokenBucket::builder()
            .rate(1)
            .capacity(1_000_000_000)
            .initial_tokens(0)
            .resolution(Duration::from_millis(16))
            .clock(Arc::clone(&clock))
            .build()
            .unwrap();
        let writers: i64 = 8;
        let per_writer: i64 = 100_000;
        std::thread::scope(|s| {
            for _ in 0..writers {
                s.spawn(|| {
                    for _ in 0..per_writer {
                        bucket.consume_tokens(1);
                    }
                });
            }
        });
        // the clock never advanced, so nothing was produced
        assert_eq!(bucket.consistent_tokens(), -(writers * per_writer));
        assert_eq!(bucket.pending_consumed.sum(), 0);
    }

    #[test]
    fn consecutive_consumes_equal_one_combined_consume() {
        let clock = manual_clock();
        let split = strict_bucket(&clock);
        let combined = strict_bucket(&clock);
        clock.advance(Duration::from_secs(3));
        split.consume_tokens(7);
        split.consume_tokens(13);
        combined.consume_tokens(20);
        assert_eq!(split.consistent_tokens(), combined.consistent_tokens());
    }

    #[test]
    fn exposes_configuration() {
        let clock = manual_clock();
        let bucket = strict_bucket(&clock);
        assert_eq!(bucket.rate(), 10);
        assert_eq!(bucket.capacity(), 100);
    }

    #[test]
    fn initial_tokens_are_clamped_to_capacity() {
        let clock = manual_clock();
        let bucket = AsyncTokenBucket::builder()
            .rate(10)
            .capacity(50)
            .initial_tokens(500)
            .resolution(Duration::ZERO)
            .clock(Arc::clone(&clock))
            .build()
            .unwrap();
        assert_eq!(bucket.tokens(), 50);
    }

    #[test]
    fn dynamic_rate_uses_rate_at_update_time() {
        let clock = manual_clock();
        let rate = Arc::new(AtomicI64::new(10));
        let supplier = Arc::clone(&rate);
        let bucket = AsyncTokenBucket::dynamic_builder()
            .rate_fn(move || supplier.load(Ordering::Acquire))
            .capacity_factor(100.0)
            .initial_fill_factor(0.0)
            .resolution(Duration::ZERO)
            .clock(Arc::clone(&clock))
            .build()
            .unwrap();

        clock.advance(Duration::from_secs(5));
        assert_eq!(bucket.tokens(), 50);

        rate.store(20, Ordering::Release);
        clock.advance(Duration::from_secs(5));
        assert_eq!(bucket.tokens(), 150);
        assert_eq!(bucket.rate(), 20);
        assert_eq!(bucket.capacity(), 2000);
    }

    #[test]
    fn uncommitted_interval_integrates_at_the_reconciliation_rate() {
        let clock = manual_clock();
        let rate = Arc::new(AtomicI64::new(10));
        let supplier = Arc::clone(&rate);
        let bucket = AsyncTokenBucket::dynamic_builder()
            .rate_fn(move || supplier.load(Ordering::Acquire))
            .capacity_factor(100.0)
            .initial_fill_factor(0.0)
            .resolution(Duration::ZERO)
            .clock(Arc::clone(&clock))
            .build()
            .unwrap();

        // no reads while time passes, then a rate change: the whole interval
        // is integrated at the new rate
        clock.advance(Duration::from_secs(5));
        rate.store(20, Ordering::Release);
        assert_eq!(bucket.tokens(), 100);
    }
}
