use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Trait for monotonic clock implementations used by token buckets.
///
/// The returned value is a monotonic timestamp in nanoseconds: it must never
/// decrease across calls on any given implementation. The epoch is arbitrary
/// and implementation-defined.
pub trait ClockSource {
    /// Returns the current monotonic time in nanoseconds.
    ///
    /// When `high_precision` is true the implementation must sample the
    /// underlying clock directly. When false, a cached value of granular
    /// precision is acceptable.
    fn nanos(&self, high_precision: bool) -> i64;
}

impl<C: ClockSource + ?Sized> ClockSource for &C {
    fn nanos(&self, high_precision: bool) -> i64 {
        (**self).nanos(high_precision)
    }
}

impl<C: ClockSource + ?Sized> ClockSource for Arc<C> {
    fn nanos(&self, high_precision: bool) -> i64 {
        (**self).nanos(high_precision)
    }
}

/// Standard clock implementation using [`std::time::Instant`].
///
/// Every read samples the OS clock, so high-precision and coarse reads are
/// identical. This is the default clock and the safe choice; on platforms
/// where the monotonic time syscall is expensive, [`GranularClock`] trades a
/// bounded staleness for much cheaper reads.
#[derive(Clone)]
pub struct StdClock {
    origin: Instant,
}

impl Default for StdClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl ClockSource for StdClock {
    fn nanos(&self, _high_precision: bool) -> i64 {
        self.origin.elapsed().as_nanos() as i64
    }
}

/// High-precision clock implementation using the `quanta` crate.
///
/// Requires the "quanta" feature to be enabled. Useful as a cheaper direct
/// source than [`StdClock`] on platforms where `quanta` calibrates to the
/// CPU timestamp counter.
#[cfg(feature = "quanta")]
#[derive(Clone)]
pub struct QuantaClock {
    clock: quanta::Clock,
    origin: quanta::Instant,
}

#[cfg(feature = "quanta")]
impl Default for QuantaClock {
    fn default() -> Self {
        Self::new(quanta::Clock::new())
    }
}

#[cfg(feature = "quanta")]
impl QuantaClock {
    /// Creates a new `QuantaClock` from a `quanta::Clock` instance.
    pub fn new(clock: quanta::Clock) -> Self {
        let origin = clock.now();
        Self { clock, origin }
    }
}

#[cfg(feature = "quanta")]
impl ClockSource for QuantaClock {
    fn nanos(&self, _high_precision: bool) -> i64 {
        (self.clock.now() - self.origin).as_nanos() as i64
    }
}

/// Manual clock implementation for testing and simulation.
///
/// Allows precise control over time progression, making it ideal for unit
/// tests and deterministic simulations of bucket behaviour.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use std::time::Duration;
/// use virta::{AsyncTokenBucket, ManualClock};
///
/// let clock = Arc::new(ManualClock::new(1_000_000_000));
/// let bucket = AsyncTokenBucket::builder()
///     .rate(10)
///     .initial_tokens(0)
///     .resolution(Duration::ZERO)
///     .clock(Arc::clone(&clock))
///     .build()
///     .unwrap();
///
/// clock.advance(Duration::from_secs(1));
/// assert_eq!(bucket.tokens(), 10);
/// ```
pub struct ManualClock {
    now_nanos: AtomicI64,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(0)
    }
}

impl ManualClock {
    /// Creates a new manual clock starting at the specified nanosecond value.
    pub fn new(now_nanos: i64) -> Self {
        Self {
            now_nanos: AtomicI64::new(now_nanos),
        }
    }

    /// Sets the current time to the specified nanosecond value.
    pub fn set_nanos(&self, now_nanos: i64) {
        self.now_nanos.store(now_nanos, Ordering::Release);
    }

    /// Advances the current time by the specified duration.
    pub fn advance(&self, delta: Duration) {
        self.now_nanos
            .fetch_add(delta.as_nanos() as i64, Ordering::AcqRel);
    }
}

impl ClockSource for ManualClock {
    fn nanos(&self, _high_precision: bool) -> i64 {
        self.now_nanos.load(Ordering::Acquire)
    }
}

struct TickerShared {
    cached_nanos: AtomicI64,
    closed: AtomicBool,
    raw: Box<dyn Fn() -> i64 + Send + Sync>,
}

/// A clock source optimized for read throughput: coarse reads return a
/// cached timestamp refreshed by a background ticker thread.
///
/// On some platforms the monotonic time syscall dominates the cost of a
/// token-bucket operation. This source samples the raw clock once per
/// `granularity` on a dedicated thread and serves coarse reads from the
/// cached value. A high-precision read samples the raw clock directly and
/// refreshes the cache as a side effect.
///
/// The ticker thread is stopped deterministically by [`close`](Self::close)
/// (also invoked on drop). After close, coarse reads return the last cached
/// sample forever; callers are expected to stop using clocks they have
/// closed.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use virta::{ClockSource, GranularClock};
///
/// let clock = GranularClock::with_granularity(Duration::from_millis(1));
/// let coarse = clock.nanos(false);
/// let precise = clock.nanos(true);
/// assert!(precise >= coarse);
/// clock.close();
/// ```
pub struct GranularClock {
    shared: Arc<TickerShared>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl GranularClock {
    /// Creates a granular clock from a raw sampler.
    ///
    /// `raw` must return monotonic nanoseconds. The background ticker stores
    /// a fresh sample into the cache once per `granularity`.
    pub fn new<F>(granularity: Duration, raw: F) -> Self
    where
        F: Fn() -> i64 + Send + Sync + 'static,
    {
        let raw: Box<dyn Fn() -> i64 + Send + Sync> = Box::new(raw);
        let shared = Arc::new(TickerShared {
            cached_nanos: AtomicI64::new(raw()),
            closed: AtomicBool::new(false),
            raw,
        });
        let ticker = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("virta-clock-ticker".into())
                .spawn(move || {
                    while !shared.closed.load(Ordering::Acquire) {
                        shared.cached_nanos.store((shared.raw)(), Ordering::Release);
                        std::thread::park_timeout(granularity);
                    }
                })
                .expect("failed to spawn clock ticker thread")
        };
        Self {
            shared,
            ticker: Mutex::new(Some(ticker)),
        }
    }

    /// Creates a granular clock backed by [`std::time::Instant`].
    pub fn with_granularity(granularity: Duration) -> Self {
        let origin = Instant::now();
        Self::new(granularity, move || origin.elapsed().as_nanos() as i64)
    }

    /// Stops the ticker thread and freezes the coarse value.
    ///
    /// Blocks until the ticker has exited. Idempotent.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        let ticker = self.ticker.lock().unwrap().take();
        if let Some(ticker) = ticker {
            ticker.thread().unpark();
            let _ = ticker.join();
        }
    }
}

impl Drop for GranularClock {
    fn drop(&mut self) {
        self.close();
    }
}

impl ClockSource for GranularClock {
    fn nanos(&self, high_precision: bool) -> i64 {
        if high_precision {
            let current_nanos = (self.shared.raw)();
            self.shared
                .cached_nanos
                .store(current_nanos, Ordering::Release);
            current_nanos
        } else {
            self.shared.cached_nanos.load(Ordering::Acquire)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(0);
        assert_eq!(clock.nanos(true), 0);
        clock.advance(Duration::from_secs(1));
        assert_eq!(clock.nanos(false), 1_000_000_000);
        clock.set_nanos(5);
        assert_eq!(clock.nanos(true), 5);
    }

    #[test]
    fn std_clock_is_monotonic() {
        let clock = StdClock::default();
        let first = clock.nanos(true);
        let second = clock.nanos(false);
        assert!(second >= first);
    }

    #[test]
    fn granular_clock_refreshes_cache_on_high_precision_reads() {
        let source = Arc::new(AtomicI64::new(1_000));
        let reader = Arc::clone(&source);
        // a granularity far beyond the test duration keeps the ticker parked
        // after its first sample
        let clock = GranularClock::new(Duration::from_secs(3600), move || {
            reader.load(Ordering::Acquire)
        });
        assert_eq!(clock.nanos(false), 1_000);
        source.store(2_000, Ordering::Release);
        assert_eq!(clock.nanos(true), 2_000);
        assert_eq!(clock.nanos(false), 2_000);
        clock.close();
    }

    #[test]
    fn granular_clock_freezes_after_close() {
        let source = Arc::new(AtomicI64::new(1));
        let reader = Arc::clone(&source);
        let clock = GranularClock::new(Duration::from_millis(1), move || {
            reader.load(Ordering::Acquire)
        });
        clock.close();
        source.store(1_000_000, Ordering::Release);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(clock.nanos(false), 1);
    }

    #[test]
    fn granular_ticker_advances_the_coarse_value() {
        let clock = GranularClock::with_granularity(Duration::from_millis(1));
        let first = clock.nanos(false);
        std::thread::sleep(Duration::from_millis(50));
        assert!(clock.nanos(false) > first);
        clock.close();
    }

    #[test]
    fn close_is_idempotent() {
        let clock = GranularClock::with_granularity(Duration::from_millis(1));
        clock.close();
        clock.close();
    }
}
