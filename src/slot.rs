//! Slot state machine
//!
//! A slot is the pool-owned container that carries one pooled object across
//! its incarnations. The state field is the synchronisation point: every
//! transition is a compare-and-swap, and whichever thread wins a transition
//! holds exclusive ownership of the slot's payload until it hands the slot
//! off to a queue.
//!
//! ```text
//!           allocator publishes
//! Dead ──────────────────────────▶ Live ──── claim ────▶ Claimed
//!  ▲                                ▲                       │
//!  │ release dead / expired         └──── release live ─────┤
//!  └────────────────────────────────────────────────────────┘
//!
//! Dead ──── deallocated for shutdown or shrink ────▶ Tombstone
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use parking_lot::Mutex;

use crate::error::BoxError;

/// Lifecycle state of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum SlotState {
    /// Holds an object, waiting in the live queue to be claimed.
    Live = 0,
    /// Exclusively held by one claimer.
    Claimed = 1,
    /// Needs (re)allocation or deallocation; owned by the dead queue.
    Dead = 2,
    /// Deallocated for good; never re-enters any queue.
    Tombstone = 3,
}

impl SlotState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Live,
            1 => Self::Claimed,
            2 => Self::Dead,
            _ => Self::Tombstone,
        }
    }
}

/// One pooled object's container, owned by the pool for its whole lifetime.
pub(crate) struct Slot<T> {
    state: AtomicU8,
    value: Mutex<Option<T>>,
    failure: Mutex<Option<BoxError>>,
    created_at_millis: AtomicU64,
    claim_count: AtomicU64,
    /// Set when the slot holds a shrink reservation and must be tombstoned
    /// instead of reallocated.
    retired: AtomicBool,
    /// Pool id, for diagnostic assertions only.
    owner: u64,
}

impl<T> Slot<T> {
    /// New slots start dead: they carry no object until an allocation worker
    /// publishes one.
    pub(crate) fn new(owner: u64) -> Self {
        Self {
            state: AtomicU8::new(SlotState::Dead as u8),
            value: Mutex::new(None),
            failure: Mutex::new(None),
            created_at_millis: AtomicU64::new(0),
            claim_count: AtomicU64::new(0),
            retired: AtomicBool::new(false),
            owner,
        }
    }

    pub(crate) fn state(&self) -> SlotState {
        SlotState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Attempt the `from → to` transition. Returns false if another thread
    /// moved the slot first.
    pub(crate) fn transition(&self, from: SlotState, to: SlotState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Publish a freshly allocated object: `Dead → Live` with the payload,
    /// timestamp, and claim count installed first.
    ///
    /// Only an allocation worker holding the slot off-queue may call this.
    pub(crate) fn publish(&self, obj: T, now_millis: u64) -> bool {
        *self.value.lock() = Some(obj);
        self.created_at_millis.store(now_millis, Ordering::Release);
        self.claim_count.store(0, Ordering::Release);
        self.transition(SlotState::Dead, SlotState::Live)
    }

    /// Move the payload out of the slot.
    pub(crate) fn take_value(&self) -> Option<T> {
        self.value.lock().take()
    }

    /// Put a payload back, e.g. on release or when routing a stale object to
    /// the dead queue for deallocation.
    pub(crate) fn put_value(&self, obj: T) {
        *self.value.lock() = Some(obj);
    }

    /// Record an allocation failure so the next claimer surfaces it.
    pub(crate) fn record_failure(&self, err: BoxError) {
        *self.failure.lock() = Some(err);
    }

    /// Take a recorded allocation failure, clearing it.
    pub(crate) fn take_failure(&self) -> Option<BoxError> {
        self.failure.lock().take()
    }

    pub(crate) fn created_at_millis(&self) -> u64 {
        self.created_at_millis.load(Ordering::Acquire)
    }

    pub(crate) fn claim_count(&self) -> u64 {
        self.claim_count.load(Ordering::Acquire)
    }

    pub(crate) fn bump_claim_count(&self) {
        self.claim_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn mark_retired(&self) {
        self.retired.store(true, Ordering::Release);
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub(crate) fn owner(&self) -> u64 {
        self.owner
    }
}
