//! Shared fixtures for the integration tests
#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tidepool::{Allocator, BoxError, Expiration, SlotInfo};

struct AllocatorCounters {
    allocations: AtomicU64,
    deallocations: AtomicU64,
}

/// Allocator handing out the (1-based) allocation attempt number, with a
/// programmable failure pattern. Clones share counters.
#[derive(Clone)]
pub struct CountingAllocator {
    counters: Arc<AllocatorCounters>,
    fail_on: Arc<dyn Fn(u64) -> bool + Send + Sync>,
}

impl CountingAllocator {
    pub fn new() -> Self {
        Self::failing_when(|_| false)
    }

    /// Fail every attempt for which `fail_on(attempt_number)` is true.
    pub fn failing_when(fail_on: impl Fn(u64) -> bool + Send + Sync + 'static) -> Self {
        Self {
            counters: Arc::new(AllocatorCounters {
                allocations: AtomicU64::new(0),
                deallocations: AtomicU64::new(0),
            }),
            fail_on: Arc::new(fail_on),
        }
    }

    /// Allocation attempts so far, including failed ones.
    pub fn allocations(&self) -> u64 {
        self.counters.allocations.load(Ordering::SeqCst)
    }

    pub fn deallocations(&self) -> u64 {
        self.counters.deallocations.load(Ordering::SeqCst)
    }
}

impl Allocator<u64> for CountingAllocator {
    fn allocate(&self) -> Result<u64, BoxError> {
        let attempt = self.counters.allocations.fetch_add(1, Ordering::SeqCst) + 1;
        if (self.fail_on)(attempt) {
            return Err(format!("allocation attempt {attempt} failed on purpose").into());
        }
        Ok(attempt)
    }

    fn deallocate(&self, _obj: u64) {
        self.counters.deallocations.fetch_add(1, Ordering::SeqCst);
    }
}

struct ExpirationInner {
    replies: Vec<bool>,
    count: AtomicUsize,
}

/// Expiration that counts its calls and returns pre-programmed replies,
/// sticking to the last reply once the programme runs out.
#[derive(Clone)]
pub struct CountingExpiration {
    inner: Arc<ExpirationInner>,
}

impl CountingExpiration {
    pub fn new(replies: &[bool]) -> Self {
        assert!(!replies.is_empty(), "need at least one reply");
        Self {
            inner: Arc::new(ExpirationInner {
                replies: replies.to_vec(),
                count: AtomicUsize::new(0),
            }),
        }
    }

    /// Never expires anything.
    pub fn never() -> Self {
        Self::new(&[false])
    }

    pub fn count(&self) -> usize {
        self.inner.count.load(Ordering::SeqCst)
    }
}

impl<T> Expiration<T> for CountingExpiration {
    fn has_expired(&self, _info: &SlotInfo<'_, T>) -> bool {
        let count = self.inner.count.fetch_add(1, Ordering::SeqCst);
        let index = count.min(self.inner.replies.len() - 1);
        self.inner.replies[index]
    }
}

/// Poll `cond` until it holds or `patience` runs out.
pub fn eventually(patience: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + patience;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}
