//! Blocking hand-off queue of live slots

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::slot::Slot;

/// FIFO hand-off of live, unclaimed slots.
///
/// `push` never blocks and never rejects: capacity accounting belongs to
/// slot creation, not to the queue. `pop` blocks up to a caller-supplied
/// timeout.
pub(crate) struct LiveQueue<T> {
    inner: Mutex<VecDeque<Arc<Slot<T>>>>,
    not_empty: Condvar,
}

impl<T> LiveQueue<T> {
    pub(crate) fn new(capacity_hint: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity_hint)),
            not_empty: Condvar::new(),
        }
    }

    pub(crate) fn push(&self, slot: Arc<Slot<T>>) {
        self.inner.lock().push_back(slot);
        self.not_empty.notify_one();
    }

    /// Pop a slot, waiting up to `timeout` for one to be pushed.
    pub(crate) fn pop(&self, timeout: Duration) -> Option<Arc<Slot<T>>> {
        let deadline = Instant::now().checked_add(timeout)?;
        let mut queue = self.inner.lock();
        loop {
            if let Some(slot) = queue.pop_front() {
                return Some(slot);
            }
            if self.not_empty.wait_until(&mut queue, deadline).timed_out() {
                return queue.pop_front();
            }
        }
    }

    pub(crate) fn try_pop(&self) -> Option<Arc<Slot<T>>> {
        self.inner.lock().pop_front()
    }

    /// Take every queued slot at once; used by shutdown and shrink passes.
    pub(crate) fn drain(&self) -> Vec<Arc<Slot<T>>> {
        self.inner.lock().drain(..).collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().len()
    }
}
