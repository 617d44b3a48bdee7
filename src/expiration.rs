//! Expiration policies for pooled objects
//!
//! An [`Expiration`] decides, at claim time, whether a slot's object should
//! be discarded and replaced. The built-in [`TimeExpiration`] expires objects
//! strictly older than a fixed time-to-live.

use std::time::Duration;

use rand::Rng;

use crate::error::{PoolError, PoolResult};

/// Read-only view of a slot handed to [`Expiration::has_expired`].
pub struct SlotInfo<'a, T> {
    age_millis: u64,
    claim_count: u64,
    poolable: &'a T,
}

impl<'a, T> SlotInfo<'a, T> {
    /// Build a view directly; useful for testing custom expirations.
    pub fn new(age_millis: u64, claim_count: u64, poolable: &'a T) -> Self {
        Self { age_millis, claim_count, poolable }
    }

    /// Milliseconds since the object was allocated, at the coarse clock's
    /// ~10 ms precision.
    pub fn age_millis(&self) -> u64 {
        self.age_millis
    }

    /// Number of successful claims of the current incarnation.
    pub fn claim_count(&self) -> u64 {
        self.claim_count
    }

    /// The pooled object itself.
    pub fn poolable(&self) -> &T {
        self.poolable
    }
}

/// Decides whether a pooled object should be discarded.
///
/// Must be a pure function of the slot view: no side effects, no blocking.
pub trait Expiration<T>: Send + Sync {
    /// Return true to have the slot's object deallocated and replaced.
    fn has_expired(&self, info: &SlotInfo<'_, T>) -> bool;
}

impl<T, F> Expiration<T> for F
where
    F: Fn(&SlotInfo<'_, T>) -> bool + Send + Sync,
{
    fn has_expired(&self, info: &SlotInfo<'_, T>) -> bool {
        self(info)
    }
}

/// Expires objects strictly older than a fixed time-to-live.
///
/// An age exactly equal to the TTL is not expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeExpiration {
    ttl_millis: u64,
}

impl TimeExpiration {
    /// Create an expiration with the given time-to-live.
    ///
    /// The TTL must be at least one millisecond.
    pub fn after(ttl: Duration) -> PoolResult<Self> {
        let ttl_millis = ttl.as_millis() as u64;
        if ttl_millis == 0 {
            return Err(PoolError::invalid_config(
                "expiration TTL must be at least one millisecond",
            ));
        }
        Ok(Self { ttl_millis })
    }

    /// Create an expiration with a TTL drawn uniformly from `[lo, hi]`.
    ///
    /// Jittering the TTL spreads out reallocation spikes when many objects
    /// were allocated together.
    pub fn with_jitter(lo: Duration, hi: Duration) -> PoolResult<Self> {
        let lo_millis = lo.as_millis() as u64;
        let hi_millis = hi.as_millis() as u64;
        if lo_millis == 0 || hi_millis < lo_millis {
            return Err(PoolError::invalid_config(
                "jitter window must be non-empty and start at one millisecond or more",
            ));
        }
        let ttl_millis = rand::thread_rng().gen_range(lo_millis..=hi_millis);
        Ok(Self { ttl_millis })
    }

    pub(crate) fn default_window() -> Self {
        // 8 to 10 minutes.
        let ttl_millis = rand::thread_rng().gen_range(480_000..=600_000);
        Self { ttl_millis }
    }

    /// The configured time-to-live.
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_millis)
    }
}

impl<T> Expiration<T> for TimeExpiration {
    fn has_expired(&self, info: &SlotInfo<'_, T>) -> bool {
        info.age_millis() > self.ttl_millis
    }
}
