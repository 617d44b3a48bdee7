//! Monotonic time sources
//!
//! The hot claim path only ever needs time that is roughly right, so the
//! default source is an [`AsynchronousClock`]: a background keeper thread
//! samples the precise system clock about every 10 milliseconds and publishes
//! the reading into an atomic, making every read a single load. Deadline
//! arithmetic that needs full resolution uses [`PreciseClock`] instead.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// A monotonic source of time.
///
/// Successive reads by any thread are non-decreasing. Readings may repeat and
/// may lag the real clock by the source's precision, but never move backward.
pub trait MonotonicClock: Send + Sync {
    /// Current reading in milliseconds since an arbitrary fixed origin.
    fn now_millis(&self) -> u64;

    /// Current reading in nanoseconds since an arbitrary fixed origin.
    fn now_nanos(&self) -> u64;
}

/// Coarse monotonic clock updated by a background keeper thread.
///
/// Reads are a single atomic load. Precision is bounded by the keeper's
/// sample interval, about 10 ms.
pub struct AsynchronousClock {
    base: Instant,
    nanos: AtomicU64,
}

impl AsynchronousClock {
    pub(crate) fn new() -> Self {
        Self {
            base: Instant::now(),
            nanos: AtomicU64::new(0),
        }
    }

    /// Publish a fresh reading. `fetch_max` keeps the published value
    /// non-decreasing even if samples race.
    pub(crate) fn sample(&self) {
        let now = self.base.elapsed().as_nanos() as u64;
        self.nanos.fetch_max(now, Ordering::AcqRel);
    }
}

impl MonotonicClock for AsynchronousClock {
    fn now_millis(&self) -> u64 {
        self.now_nanos() / 1_000_000
    }

    fn now_nanos(&self) -> u64 {
        self.nanos.load(Ordering::Acquire)
    }
}

/// Synchronous monotonic clock reading [`Instant`] on every call.
///
/// Used where full resolution matters: timeout arithmetic and final deadline
/// checks.
pub struct PreciseClock {
    base: Instant,
}

impl PreciseClock {
    /// Create a clock with its origin at the current instant.
    pub fn new() -> Self {
        Self { base: Instant::now() }
    }
}

impl Default for PreciseClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock for PreciseClock {
    fn now_millis(&self) -> u64 {
        self.base.elapsed().as_millis() as u64
    }

    fn now_nanos(&self) -> u64 {
        self.base.elapsed().as_nanos() as u64
    }
}

/// Keeper loop feeding an [`AsynchronousClock`].
///
/// Started by the scheduler on its first reference and stopped on the last.
#[derive(Clone)]
pub(crate) struct TimeKeeper {
    clock: Arc<AsynchronousClock>,
    stop: Arc<AtomicBool>,
}

impl TimeKeeper {
    pub(crate) const SAMPLE_INTERVAL: Duration = Duration::from_millis(10);

    pub(crate) fn new(clock: Arc<AsynchronousClock>) -> Self {
        Self {
            clock,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sample-and-sleep until stopped. The final sample before exit keeps the
    /// published value as fresh as possible for late readers.
    pub(crate) fn run(&self) {
        while !self.stop.load(Ordering::Acquire) {
            self.clock.sample();
            thread::sleep(Self::SAMPLE_INTERVAL);
        }
        self.clock.sample();
    }

    pub(crate) fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }
}
