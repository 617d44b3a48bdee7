//! Lock-free stack of dead slots

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::slot::Slot;

struct Node<T> {
    slot: Arc<Slot<T>>,
    next: *mut Node<T>,
}

/// Treiber stack of slots awaiting (re)allocation or deallocation.
///
/// A single atomic head pointer; push and pop are CAS loops. Unbounded:
/// every slot that can land here was accounted for at creation time.
pub(crate) struct DeadQueue<T> {
    head: AtomicPtr<Node<T>>,
    len: AtomicUsize,
}

impl<T> DeadQueue<T> {
    pub(crate) fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            len: AtomicUsize::new(0),
        }
    }

    pub(crate) fn push(&self, slot: Arc<Slot<T>>) {
        let node = Box::into_raw(Box::new(Node {
            slot,
            next: ptr::null_mut(),
        }));

        loop {
            let head = self.head.load(Ordering::Acquire);
            unsafe {
                (*node).next = head;
            }
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => {
                    self.len.fetch_add(1, Ordering::Relaxed);
                    break;
                },
                Err(_) => continue,
            }
        }
    }

    pub(crate) fn pop(&self) -> Option<Arc<Slot<T>>> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            if head.is_null() {
                return None;
            }
            let next = unsafe { (*head).next };
            match self
                .head
                .compare_exchange_weak(head, next, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => {
                    self.len.fetch_sub(1, Ordering::Relaxed);
                    let node = unsafe { Box::from_raw(head) };
                    return Some(node.slot);
                },
                Err(_) => continue,
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Drop for DeadQueue<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

// The queue only moves Arc<Slot<T>> between threads.
unsafe impl<T: Send> Send for DeadQueue<T> {}
unsafe impl<T: Send> Sync for DeadQueue<T> {}
