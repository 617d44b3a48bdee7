//! Statistics tracking for pools

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic operation counters for one pool.
#[derive(Debug, Default)]
pub struct PoolStats {
    pub(crate) claims: AtomicU64,
    pub(crate) claim_timeouts: AtomicU64,
    pub(crate) claim_failures: AtomicU64,
    pub(crate) expirations: AtomicU64,
    pub(crate) allocations: AtomicU64,
    pub(crate) allocation_failures: AtomicU64,
    pub(crate) deallocations: AtomicU64,
    pub(crate) tombstones: AtomicU64,
}

impl PoolStats {
    pub(crate) fn record_claim(&self) {
        self.claims.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_claim_timeout(&self) {
        self.claim_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_claim_failure(&self) {
        self.claim_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_expiration(&self) {
        self.expirations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_allocation_attempt(&self) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_allocation_failure(&self) {
        self.allocation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_deallocation(&self) {
        self.deallocations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_tombstone(&self) {
        self.tombstones.fetch_add(1, Ordering::Relaxed);
    }

    /// Total successful claims.
    pub fn total_claims(&self) -> u64 {
        self.claims.load(Ordering::Relaxed)
    }

    /// Claims that returned empty after their timeout.
    pub fn total_claim_timeouts(&self) -> u64 {
        self.claim_timeouts.load(Ordering::Relaxed)
    }

    /// Allocation attempts, including failed ones.
    pub fn total_allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Allocation attempts that failed.
    pub fn total_allocation_failures(&self) -> u64 {
        self.allocation_failures.load(Ordering::Relaxed)
    }

    /// Objects handed back to the allocator for teardown.
    pub fn total_deallocations(&self) -> u64 {
        self.deallocations.load(Ordering::Relaxed)
    }

    /// Slots permanently retired by shutdown or shrinking.
    pub fn total_tombstones(&self) -> u64 {
        self.tombstones.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            claims: self.claims.load(Ordering::Relaxed),
            claim_timeouts: self.claim_timeouts.load(Ordering::Relaxed),
            claim_failures: self.claim_failures.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            allocations: self.allocations.load(Ordering::Relaxed),
            allocation_failures: self.allocation_failures.load(Ordering::Relaxed),
            deallocations: self.deallocations.load(Ordering::Relaxed),
            tombstones: self.tombstones.load(Ordering::Relaxed),
        }
    }
}

/// Pool statistics snapshot
#[derive(Debug, Clone)]
pub struct PoolStatsSnapshot {
    /// Successful claims.
    pub claims: u64,
    /// Claims that returned empty after their timeout.
    pub claim_timeouts: u64,
    /// Claims that surfaced an allocation failure.
    pub claim_failures: u64,
    /// Slots routed dead because their object expired.
    pub expirations: u64,
    /// Allocation attempts, including failed ones.
    pub allocations: u64,
    /// Allocation attempts that failed.
    pub allocation_failures: u64,
    /// Objects handed back to the allocator for teardown.
    pub deallocations: u64,
    /// Slots permanently retired.
    pub tombstones: u64,
}

impl fmt::Display for PoolStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Pool statistics:")?;
        writeln!(
            f,
            "  Claims: {} ({} timeouts, {} failures)",
            self.claims, self.claim_timeouts, self.claim_failures
        )?;
        writeln!(f, "  Expirations: {}", self.expirations)?;
        writeln!(
            f,
            "  Allocations: {} ({} failed)",
            self.allocations, self.allocation_failures
        )?;
        writeln!(f, "  Deallocations: {}", self.deallocations)?;
        writeln!(f, "  Tombstones: {}", self.tombstones)?;
        Ok(())
    }
}
