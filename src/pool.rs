//! Pool façade
//!
//! Ties the slot machinery, the queues, and the background scheduler
//! together. The claim path is a fast hand-off: pop a live slot, check it,
//! move its object into an RAII guard. Everything slow happens on the
//! scheduler's worker threads, never on the claim path.

use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::clock::{AsynchronousClock, MonotonicClock};
use crate::config::PoolConfig;
use crate::error::{PoolError, PoolResult};
use crate::expiration::{Expiration, SlotInfo};
use crate::queue::{DeadQueue, LiveQueue};
use crate::scheduler::{BackgroundScheduler, ScheduledJobHandle};
use crate::slot::{Slot, SlotState};
use crate::stats::{PoolStats, PoolStatsSnapshot};
use crate::traits::Allocator;

/// Interval of the reconciliation job that tops up missing slots, routes
/// surplus ones out, and sweeps stragglers during shutdown.
const MAINTENANCE_INTERVAL: Duration = Duration::from_millis(50);

/// `Instant` arithmetic panics on overflow; a year of waiting is forever
/// for a claim.
const MAX_CLAIM_WAIT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

static POOL_IDS: AtomicU64 = AtomicU64::new(0);

struct CompletionInner {
    done: Mutex<bool>,
    cond: Condvar,
    on_done: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

/// Handle to an in-flight pool shutdown.
#[derive(Clone)]
pub struct Completion {
    inner: Arc<CompletionInner>,
}

impl Completion {
    fn new() -> Self {
        Self {
            inner: Arc::new(CompletionInner {
                done: Mutex::new(false),
                cond: Condvar::new(),
                on_done: Mutex::new(None),
            }),
        }
    }

    fn set_on_done(&self, hook: Box<dyn FnOnce() + Send>) {
        *self.inner.on_done.lock() = Some(hook);
    }

    fn mark_done(&self) {
        let mut done = self.inner.done.lock();
        if !*done {
            *done = true;
            self.inner.cond.notify_all();
        }
    }

    /// Whether the shutdown has drained every slot.
    pub fn is_done(&self) -> bool {
        *self.inner.done.lock()
    }

    /// Wait up to `timeout` for the shutdown to finish. Returns true once
    /// every slot has been deallocated and tombstoned.
    pub fn await_done(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        {
            let mut done = self.inner.done.lock();
            while !*done {
                match deadline {
                    Some(deadline) => {
                        if self.inner.cond.wait_until(&mut done, deadline).timed_out()
                            && !*done
                        {
                            return false;
                        }
                    },
                    // A timeout too large to represent is as good as forever.
                    None => self.inner.cond.wait(&mut done),
                }
            }
        }
        // First observer releases the pool's scheduler pin. Take the hook
        // out before running it; it joins threads.
        let hook = self.inner.on_done.lock().take();
        if let Some(hook) = hook {
            hook();
        }
        true
    }
}

struct PoolInner<T: Send + 'static> {
    id: u64,
    live: LiveQueue<T>,
    dead: DeadQueue<T>,
    allocator: Box<dyn Allocator<T>>,
    expiration: Box<dyn Expiration<T>>,
    scheduler: BackgroundScheduler,
    clock: Arc<AsynchronousClock>,
    target_size: AtomicUsize,
    /// Slots allocated and not yet tombstoned, whatever their state.
    live_count: AtomicUsize,
    /// Shrink reservations taken but not yet tombstoned. Keeps concurrent
    /// claims from retiring more slots than the target calls for.
    pending_retire: AtomicUsize,
    shutting_down: AtomicBool,
    shutdown_started: AtomicBool,
    reclaim_queued: AtomicBool,
    stats: PoolStats,
    completion: Completion,
    maintenance: Mutex<Option<ScheduledJobHandle>>,
}

impl<T: Send + 'static> PoolInner<T> {
    fn route_dead(this: &Arc<Self>, slot: Arc<Slot<T>>) {
        this.dead.push(slot);
        Self::schedule_reclaim(this);
    }

    /// Queue one drain of the dead queue on the scheduler. Single-flight:
    /// while a drain is queued, further requests are no-ops.
    fn schedule_reclaim(this: &Arc<Self>) {
        if this.reclaim_queued.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = Arc::clone(this);
        let submitted = this.scheduler.submit(move || {
            inner.reclaim_queued.store(false, Ordering::Release);
            PoolInner::drain_dead(&inner);
        });
        if let Err(err) = submitted {
            this.reclaim_queued.store(false, Ordering::Release);
            tracing::warn!(pool = this.id, error = %err, "could not schedule reclamation");
        }
    }

    fn drain_dead(this: &Arc<Self>) {
        while let Some(slot) = this.dead.pop() {
            Self::process_dead(this, slot);
        }
    }

    /// Take one shrink reservation if the pool is above target. Each
    /// reservation licenses exactly one slot retirement.
    fn try_reserve_retire(this: &Arc<Self>) -> bool {
        loop {
            let pending = this.pending_retire.load(Ordering::Acquire);
            let live = this.live_count.load(Ordering::Acquire);
            let target = this.target_size.load(Ordering::Acquire);
            if live.saturating_sub(pending) <= target {
                return false;
            }
            if this
                .pending_retire
                .compare_exchange(pending, pending + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    fn release_retire_reservation(this: &Arc<Self>) {
        this.pending_retire.fetch_sub(1, Ordering::AcqRel);
    }

    /// Runs on a scheduler worker: tear down the slot's stale object, then
    /// either retire the slot for good or give it a fresh incarnation.
    fn process_dead(this: &Arc<Self>, slot: Arc<Slot<T>>) {
        if let Some(stale) = slot.take_value() {
            Self::deallocate(this, stale);
        }

        if slot.is_retired() {
            Self::release_retire_reservation(this);
            Self::tombstone(this, slot);
            return;
        }
        if this.shutting_down.load(Ordering::Acquire) {
            Self::tombstone(this, slot);
            return;
        }

        this.stats.record_allocation_attempt();
        match catch_unwind(AssertUnwindSafe(|| this.allocator.allocate())) {
            Ok(Ok(obj)) => {
                if this.shutting_down.load(Ordering::Acquire) {
                    // Shutdown won the race; tear the fresh object straight
                    // back down instead of publishing it.
                    Self::deallocate(this, obj);
                    Self::tombstone(this, slot);
                    return;
                }
                if slot.publish(obj, this.clock.now_millis()) {
                    this.live.push(slot);
                } else {
                    tracing::error!(pool = this.id, "dead slot could not be published");
                }
            },
            Ok(Err(err)) => {
                this.stats.record_allocation_failure();
                slot.record_failure(err);
                // Published poisoned: the next claimer surfaces the failure
                // and sends the slot around for another attempt.
                this.live.push(slot);
            },
            Err(_) => {
                this.stats.record_allocation_failure();
                slot.record_failure("allocator panicked".into());
                this.live.push(slot);
            },
        }
    }

    fn deallocate(this: &Arc<Self>, obj: T) {
        this.stats.record_deallocation();
        if catch_unwind(AssertUnwindSafe(|| this.allocator.deallocate(obj))).is_err() {
            tracing::warn!(pool = this.id, "deallocate panicked; object abandoned");
        }
    }

    fn tombstone(this: &Arc<Self>, slot: Arc<Slot<T>>) {
        if !slot.transition(SlotState::Dead, SlotState::Tombstone) {
            tracing::error!(pool = this.id, "tombstone of a slot that was not dead");
            return;
        }
        this.stats.record_tombstone();
        let remaining = this.live_count.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 && this.shutting_down.load(Ordering::Acquire) {
            Self::complete_shutdown(this);
        }
    }

    fn complete_shutdown(this: &Arc<Self>) {
        if let Some(handle) = this.maintenance.lock().take() {
            handle.cancel();
        }
        this.completion.mark_done();
    }

    /// Reconciliation pass: create missing slots, lazily route surplus idle
    /// slots out, and sweep the live queue during shutdown. Runs at
    /// construction, on resize, and on the periodic maintenance tick.
    fn maintain(this: &Arc<Self>) {
        if this.shutting_down.load(Ordering::Acquire) {
            // Slots published concurrently with the shutdown drain land back
            // in the live queue; sweep them out until none remain.
            for slot in this.live.drain() {
                let _ = slot.transition(SlotState::Live, SlotState::Dead);
                this.dead.push(slot);
            }
            if !this.dead.is_empty() {
                Self::schedule_reclaim(this);
            } else if this.live_count.load(Ordering::Acquire) == 0
                && !this.completion.is_done()
            {
                // The final tombstone and the shutdown call can race past
                // each other; the tick settles it.
                Self::complete_shutdown(this);
            }
            return;
        }

        let target = this.target_size.load(Ordering::Acquire);

        loop {
            let current = this.live_count.load(Ordering::Acquire);
            if current >= target {
                break;
            }
            if this
                .live_count
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                this.dead.push(Arc::new(Slot::new(this.id)));
            }
        }

        // Route surplus idle slots out, one reservation per retirement.
        while Self::try_reserve_retire(this) {
            let Some(slot) = this.live.try_pop() else {
                // Nothing idle right now; the claim path retires the rest.
                Self::release_retire_reservation(this);
                break;
            };
            slot.mark_retired();
            let _ = slot.transition(SlotState::Live, SlotState::Dead);
            this.dead.push(slot);
        }

        if !this.dead.is_empty() {
            Self::schedule_reclaim(this);
        }
    }

    fn release(this: &Arc<Self>, slot: Arc<Slot<T>>, value: T, invalidated: bool) {
        debug_assert_eq!(slot.owner(), this.id, "slot released to a foreign pool");
        slot.put_value(value);

        let mut route_dead = invalidated || this.shutting_down.load(Ordering::Acquire);
        if !route_dead && Self::try_reserve_retire(this) {
            slot.mark_retired();
            route_dead = true;
        }

        if route_dead {
            if slot.transition(SlotState::Claimed, SlotState::Dead) {
                Self::route_dead(this, slot);
            } else {
                tracing::error!(pool = this.id, "released slot was not claimed");
            }
        } else if slot.transition(SlotState::Claimed, SlotState::Live) {
            this.live.push(slot);
        } else {
            tracing::error!(pool = this.id, "released slot was not claimed");
        }
    }
}

impl<T: Send + 'static> Drop for PoolInner<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.maintenance.get_mut().take() {
            handle.cancel();
        }
        // The background machinery is gone once the last handle drops; tear
        // down whatever still sits in the queues inline.
        for slot in self.live.drain() {
            if let Some(obj) = slot.take_value() {
                self.stats.record_deallocation();
                if catch_unwind(AssertUnwindSafe(|| self.allocator.deallocate(obj))).is_err() {
                    tracing::warn!(pool = self.id, "deallocate panicked during teardown");
                }
            }
        }
        while let Some(slot) = self.dead.pop() {
            if let Some(obj) = slot.take_value() {
                self.stats.record_deallocation();
                if catch_unwind(AssertUnwindSafe(|| self.allocator.deallocate(obj))).is_err() {
                    tracing::warn!(pool = self.id, "deallocate panicked during teardown");
                }
            }
        }
    }
}

/// A claimed object, exclusively held until dropped.
///
/// Dropping the guard releases the slot back to the pool. Call
/// [`invalidate`](Pooled::invalidate) instead when the object is known to be
/// broken and should be torn down and replaced.
pub struct Pooled<T: Send + 'static> {
    value: ManuallyDrop<T>,
    slot: ManuallyDrop<Arc<Slot<T>>>,
    pool: ManuallyDrop<Arc<PoolInner<T>>>,
    invalidated: bool,
}

impl<T: Send + 'static> Pooled<T> {
    fn new(value: T, slot: Arc<Slot<T>>, pool: Arc<PoolInner<T>>) -> Self {
        Self {
            value: ManuallyDrop::new(value),
            slot: ManuallyDrop::new(slot),
            pool: ManuallyDrop::new(pool),
            invalidated: false,
        }
    }

    /// Discard the object: the slot is routed for deallocation and a fresh
    /// allocation instead of going back into circulation.
    pub fn invalidate(mut self) {
        self.invalidated = true;
    }
}

impl<T: Send + std::fmt::Debug + 'static> std::fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Pooled").field(&*self.value).finish()
    }
}

impl<T: Send + 'static> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: Send + 'static> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T: Send + 'static> Drop for Pooled<T> {
    fn drop(&mut self) {
        let value = unsafe { ManuallyDrop::take(&mut self.value) };
        let slot = unsafe { ManuallyDrop::take(&mut self.slot) };
        let pool = unsafe { ManuallyDrop::take(&mut self.pool) };
        PoolInner::release(&pool, slot, value, self.invalidated);
    }
}

/// A pool of reusable objects with bounded size and time-bounded claims.
///
/// Cheap to clone; clones are handles to the same pool.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use tidepool::{Allocator, BoxError, Pool, PoolConfig};
///
/// struct Connections;
///
/// impl Allocator<String> for Connections {
///     fn allocate(&self) -> Result<String, BoxError> {
///         Ok("connection".to_string())
///     }
/// }
///
/// let pool = Pool::new(PoolConfig::new(Connections).with_size(4))?;
/// if let Some(conn) = pool.claim(Duration::from_secs(1))? {
///     println!("claimed: {}", *conn);
/// } // released on drop
/// let completion = pool.shutdown();
/// completion.await_done(Duration::from_secs(10));
/// # Ok::<(), tidepool::PoolError>(())
/// ```
pub struct Pool<T: Send + 'static> {
    inner: Arc<PoolInner<T>>,
}

impl<T: Send + 'static> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T: Send + 'static> Pool<T> {
    /// Build a pool from its configuration and start allocating in the
    /// background.
    pub fn new(config: PoolConfig<T>) -> PoolResult<Self> {
        if config.size == 0 {
            return Err(PoolError::invalid_config("pool size must be at least 1"));
        }

        let scheduler = config.scheduler;
        scheduler.increment_references();

        let inner = Arc::new(PoolInner {
            id: POOL_IDS.fetch_add(1, Ordering::Relaxed),
            live: LiveQueue::new(config.size),
            dead: DeadQueue::new(),
            allocator: config.allocator,
            expiration: config.expiration,
            clock: scheduler.async_clock(),
            scheduler,
            target_size: AtomicUsize::new(config.size),
            live_count: AtomicUsize::new(0),
            pending_retire: AtomicUsize::new(0),
            shutting_down: AtomicBool::new(false),
            shutdown_started: AtomicBool::new(false),
            reclaim_queued: AtomicBool::new(false),
            stats: PoolStats::default(),
            completion: Completion::new(),
            maintenance: Mutex::new(None),
        });

        let release_scheduler = inner.scheduler.clone();
        inner
            .completion
            .set_on_done(Box::new(move || release_scheduler.decrement_references()));

        let weak = Arc::downgrade(&inner);
        match inner.scheduler.schedule_with_fixed_delay(
            move || {
                if let Some(inner) = weak.upgrade() {
                    PoolInner::maintain(&inner);
                }
            },
            MAINTENANCE_INTERVAL,
        ) {
            Ok(handle) => *inner.maintenance.lock() = Some(handle),
            Err(err) => {
                tracing::error!(pool = inner.id, error = %err, "could not schedule maintenance");
            },
        }

        PoolInner::maintain(&inner);
        Ok(Self { inner })
    }

    /// Claim an object, waiting up to `timeout` for one to become live.
    ///
    /// Returns `Ok(None)` when the timeout elapses first. A slot whose last
    /// allocation failed surfaces that failure here as
    /// [`PoolError::AllocationFailed`] and is queued for another attempt.
    pub fn claim(&self, timeout: Duration) -> PoolResult<Option<Pooled<T>>> {
        let this = &self.inner;
        if this.shutting_down.load(Ordering::Acquire) {
            return Err(PoolError::PoolClosed);
        }
        let deadline = Instant::now() + timeout.min(MAX_CLAIM_WAIT);

        loop {
            // Internal retries spend the caller's budget too.
            if Instant::now() > deadline {
                this.stats.record_claim_timeout();
                return Ok(None);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(slot) = this.live.pop(remaining) else {
                this.stats.record_claim_timeout();
                return Ok(None);
            };

            if let Some(failure) = slot.take_failure() {
                PoolInner::route_dead(this, slot);
                this.stats.record_claim_failure();
                return Err(PoolError::allocation_failed(failure));
            }

            // Shrinking is lazy: surplus slots die as they surface here.
            if PoolInner::try_reserve_retire(this) {
                slot.mark_retired();
                let _ = slot.transition(SlotState::Live, SlotState::Dead);
                PoolInner::route_dead(this, slot);
                continue;
            }

            if !slot.transition(SlotState::Live, SlotState::Claimed) {
                // Stale entry, e.g. drained by a concurrent shutdown.
                PoolInner::route_dead(this, slot);
                continue;
            }

            let Some(value) = slot.take_value() else {
                let _ = slot.transition(SlotState::Claimed, SlotState::Dead);
                PoolInner::route_dead(this, slot);
                continue;
            };

            let age_millis = this
                .clock
                .now_millis()
                .saturating_sub(slot.created_at_millis());
            let info = SlotInfo::new(age_millis, slot.claim_count(), &value);
            let expired = catch_unwind(AssertUnwindSafe(|| this.expiration.has_expired(&info)))
                .unwrap_or_else(|_| {
                    tracing::error!(pool = this.id, "expiration panicked; treating as expired");
                    true
                });
            if expired {
                this.stats.record_expiration();
                slot.put_value(value);
                let _ = slot.transition(SlotState::Claimed, SlotState::Dead);
                PoolInner::route_dead(this, slot);
                continue;
            }

            slot.bump_claim_count();
            this.stats.record_claim();
            return Ok(Some(Pooled::new(value, slot, Arc::clone(this))));
        }
    }

    /// Begin an orderly shutdown and return a handle to wait on.
    ///
    /// One-way: no new objects are allocated, idle slots are torn down in
    /// the background, and claimed slots follow as they are released.
    /// Repeat calls return the same handle.
    pub fn shutdown(&self) -> Completion {
        let this = &self.inner;
        if !this.shutdown_started.swap(true, Ordering::AcqRel) {
            this.shutting_down.store(true, Ordering::Release);
            for slot in this.live.drain() {
                let _ = slot.transition(SlotState::Live, SlotState::Dead);
                this.dead.push(slot);
            }
            if this.live_count.load(Ordering::Acquire) == 0 {
                PoolInner::complete_shutdown(this);
            } else {
                PoolInner::schedule_reclaim(this);
            }
        }
        this.completion.clone()
    }

    /// Change the target number of pooled objects.
    ///
    /// Growing allocates in the background. Shrinking is lazy: surplus
    /// slots are torn down as they pass through the claim path or the
    /// periodic reconciliation.
    pub fn set_target_size(&self, size: usize) -> PoolResult<()> {
        if size == 0 {
            return Err(PoolError::invalid_config("pool size must be at least 1"));
        }
        let this = &self.inner;
        if this.shutting_down.load(Ordering::Acquire) {
            return Err(PoolError::PoolClosed);
        }
        this.target_size.store(size, Ordering::Release);
        PoolInner::maintain(this);
        Ok(())
    }

    /// The configured target size.
    pub fn target_size(&self) -> usize {
        self.inner.target_size.load(Ordering::Acquire)
    }

    /// Slots allocated and not yet permanently retired.
    pub fn live_count(&self) -> usize {
        self.inner.live_count.load(Ordering::Acquire)
    }

    /// Total allocation attempts, including failed ones.
    pub fn alloc_count(&self) -> u64 {
        self.inner.stats.total_allocations()
    }

    /// Point-in-time operation counters.
    pub fn stats(&self) -> PoolStatsSnapshot {
        self.inner.stats.snapshot()
    }
}
