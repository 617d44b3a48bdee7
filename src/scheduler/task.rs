//! Lock-free task stack shared across pools
//!
//! An intrusive Treiber LIFO with one twist: the bottom of the stack is
//! always a `Bootstrap` sentinel. A pusher that swaps the sentinel out of
//! the head position has just discovered that the controller is not
//! currently consuming, and must run the bootstrap inline: start the
//! controller thread if it is not running, or wake its parker. That is how
//! a cold scheduler comes up without a dedicated init lock, and how a
//! parked controller learns about new work.
//!
//! Push discipline: `swap` the head, read the previous head's sentinel flag,
//! then link `next`. The consumer spins on an unlinked `next`, so the
//! previous node cannot be reclaimed before the pusher has linked it, which
//! makes the flag read safe.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One-shot background work.
pub(crate) type Work = Box<dyn FnOnce() + Send + 'static>;

/// A fixed-delay repeating job owned by the controller's timer heap.
pub(crate) struct ScheduledJob {
    work: Box<dyn Fn() + Send + Sync + 'static>,
    delay: Duration,
    cancelled: AtomicBool,
}

impl ScheduledJob {
    pub(crate) fn new(work: Box<dyn Fn() + Send + Sync + 'static>, delay: Duration) -> Self {
        Self {
            work,
            delay,
            cancelled: AtomicBool::new(false),
        }
    }

    pub(crate) fn run(&self) {
        (self.work)()
    }

    pub(crate) fn delay(&self) -> Duration {
        self.delay
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Handle to a scheduled job; cancelling marks the job dead so the
/// controller skips and drops it at its next dispatch.
pub struct ScheduledJobHandle {
    job: Arc<ScheduledJob>,
}

impl ScheduledJobHandle {
    pub(crate) fn new(job: Arc<ScheduledJob>) -> Self {
        Self { job }
    }

    /// Stop the job from firing again.
    pub fn cancel(&self) {
        self.job.cancel();
    }
}

pub(crate) enum TaskKind {
    /// Run once on a worker thread, as soon as possible.
    Immediate(Work),
    /// Enter the controller's timer heap, firing every `delay`.
    Scheduled(Arc<ScheduledJob>),
    /// The foreground sentinel at the bottom of the stack.
    Bootstrap,
}

struct TaskNode {
    kind: TaskKind,
    next: AtomicPtr<TaskNode>,
}

impl TaskNode {
    fn alloc(kind: TaskKind) -> *mut TaskNode {
        Box::into_raw(Box::new(TaskNode {
            kind,
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }
}

/// Lock-free LIFO of pending background tasks.
pub(crate) struct TaskStack {
    head: AtomicPtr<TaskNode>,
}

impl TaskStack {
    pub(crate) fn new() -> Self {
        Self {
            head: AtomicPtr::new(TaskNode::alloc(TaskKind::Bootstrap)),
        }
    }

    /// Push a task. Returns true if the previous head was the bootstrap
    /// sentinel, in which case the caller must run the bootstrap inline.
    pub(crate) fn push(&self, kind: TaskKind) -> bool {
        let node = TaskNode::alloc(kind);
        let prev = self.head.swap(node, Ordering::AcqRel);
        // Read before linking: the consumer cannot pass our unlinked node,
        // so `prev` is still alive here.
        let was_sentinel = unsafe { matches!((*prev).kind, TaskKind::Bootstrap) };
        unsafe {
            (*node).next.store(prev, Ordering::Release);
        }
        was_sentinel
    }

    /// Take the whole stack, leaving a fresh sentinel for future pushers.
    /// Controller only.
    pub(crate) fn take(&self) -> TakenTasks {
        let sentinel = TaskNode::alloc(TaskKind::Bootstrap);
        let head = self.head.swap(sentinel, Ordering::AcqRel);
        TakenTasks { cursor: head }
    }
}

impl Drop for TaskStack {
    fn drop(&mut self) {
        // No pushers remain at drop, so the chain is fully linked down to
        // the resting sentinel (whose `next` stays null).
        let mut cursor = self.head.swap(ptr::null_mut(), Ordering::AcqRel);
        while !cursor.is_null() {
            let node = unsafe { Box::from_raw(cursor) };
            cursor = node.next.load(Ordering::Acquire);
        }
    }
}

unsafe impl Send for TaskStack {}
unsafe impl Sync for TaskStack {}

/// Iterator over a taken chain, newest first. Frees nodes as it goes and
/// stops at (and frees) the previous sentinel.
pub(crate) struct TakenTasks {
    cursor: *mut TaskNode,
}

impl TakenTasks {
    /// Wait for a pusher that has swapped the head but not yet linked
    /// `next`. The window is a handful of instructions, so spinning is fine.
    fn next_of(node: *mut TaskNode) -> *mut TaskNode {
        loop {
            let next = unsafe { (*node).next.load(Ordering::Acquire) };
            if !next.is_null() {
                return next;
            }
            std::hint::spin_loop();
        }
    }
}

impl Iterator for TakenTasks {
    type Item = TaskKind;

    fn next(&mut self) -> Option<TaskKind> {
        if self.cursor.is_null() {
            return None;
        }
        if unsafe { matches!((*self.cursor).kind, TaskKind::Bootstrap) } {
            // End of the chain: the sentinel installed by the previous take.
            drop(unsafe { Box::from_raw(self.cursor) });
            self.cursor = ptr::null_mut();
            return None;
        }
        let next = Self::next_of(self.cursor);
        let node = unsafe { Box::from_raw(self.cursor) };
        self.cursor = next;
        Some(node.kind)
    }
}

impl Drop for TakenTasks {
    fn drop(&mut self) {
        while self.next().is_some() {}
    }
}

unsafe impl Send for TakenTasks {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_first_push_reports_the_sentinel() {
        let stack = TaskStack::new();
        assert!(stack.push(TaskKind::Immediate(Box::new(|| {}))));
        // Second push lands on a regular task.
        assert!(!stack.push(TaskKind::Immediate(Box::new(|| {}))));
    }

    #[test]
    fn test_take_yields_newest_first_and_resets() {
        let stack = TaskStack::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for tag in 0..3 {
            let order = order.clone();
            stack.push(TaskKind::Immediate(Box::new(move || {
                order.lock().push(tag);
            })));
        }

        for task in stack.take() {
            match task {
                TaskKind::Immediate(work) => work(),
                _ => panic!("unexpected task kind"),
            }
        }
        assert_eq!(*order.lock(), vec![2, 1, 0]);

        // The stack is back to just the sentinel.
        assert!(stack.push(TaskKind::Immediate(Box::new(|| {}))));
    }

    #[test]
    fn test_concurrent_pushes_are_all_taken() {
        let stack = Arc::new(TaskStack::new());
        let executed = Arc::new(AtomicUsize::new(0));
        let per_thread = 200;

        let pushers: Vec<_> = (0..4)
            .map(|_| {
                let stack = stack.clone();
                let executed = executed.clone();
                thread::spawn(move || {
                    for _ in 0..per_thread {
                        let executed = executed.clone();
                        stack.push(TaskKind::Immediate(Box::new(move || {
                            executed.fetch_add(1, Ordering::Relaxed);
                        })));
                    }
                })
            })
            .collect();
        for handle in pushers {
            handle.join().unwrap();
        }

        for task in stack.take() {
            if let TaskKind::Immediate(work) = task {
                work();
            }
        }
        assert_eq!(executed.load(Ordering::Relaxed), 4 * per_thread);
    }

    #[test]
    fn test_cancelled_job_reports_cancelled() {
        let job = Arc::new(ScheduledJob::new(
            Box::new(|| {}),
            Duration::from_millis(5),
        ));
        let handle = ScheduledJobHandle::new(job.clone());
        assert!(!job.is_cancelled());
        handle.cancel();
        assert!(job.is_cancelled());
    }
}
