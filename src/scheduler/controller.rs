//! Controller thread and its worker pool
//!
//! A single controller thread owns the timer heap and the dispatch of
//! immediate work onto a small pool of worker threads. Workers are created
//! on demand up to the scheduler's thread cap and retire themselves after
//! sitting idle.

use std::collections::{BinaryHeap, VecDeque};
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::clock::{AsynchronousClock, MonotonicClock};
use crate::scheduler::task::{ScheduledJob, TaskKind, TaskStack, Work};
use crate::traits::ThreadFactory;

/// How long a worker waits for more work before retiring.
const WORKER_IDLE_TIMEOUT: Duration = Duration::from_secs(1);

/// Wake-up latch for the controller thread.
struct Parker {
    signal: Mutex<bool>,
    cond: Condvar,
}

impl Parker {
    fn new() -> Self {
        Self {
            signal: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Block until unparked, or until `timeout` elapses if one is given.
    /// Consumes a pending unpark instead of blocking.
    fn park(&self, timeout: Option<Duration>) {
        let mut signalled = self.signal.lock();
        match timeout {
            Some(timeout) => {
                if !*signalled {
                    let _ = self.cond.wait_for(&mut signalled, timeout);
                }
            },
            None => {
                while !*signalled {
                    self.cond.wait(&mut signalled);
                }
            },
        }
        *signalled = false;
    }

    fn unpark(&self) {
        let mut signalled = self.signal.lock();
        *signalled = true;
        self.cond.notify_one();
    }
}

struct TimerEntry {
    fire_at_nanos: u64,
    seq: u64,
    job: Arc<ScheduledJob>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at_nanos == other.fire_at_nanos && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.fire_at_nanos, self.seq).cmp(&(other.fire_at_nanos, other.seq))
    }
}

struct WorkerShared {
    queue: Mutex<VecDeque<Work>>,
    available: Condvar,
    stop: AtomicBool,
    idle: AtomicUsize,
    live: AtomicUsize,
}

/// On-demand worker threads bounded by the scheduler's thread cap.
struct WorkerPool {
    shared: Arc<WorkerShared>,
    factory: Arc<dyn ThreadFactory>,
    max_threads: usize,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    fn new(factory: Arc<dyn ThreadFactory>, max_threads: usize) -> Self {
        Self {
            shared: Arc::new(WorkerShared {
                queue: Mutex::new(VecDeque::new()),
                available: Condvar::new(),
                stop: AtomicBool::new(false),
                idle: AtomicUsize::new(0),
                live: AtomicUsize::new(0),
            }),
            factory,
            max_threads,
            handles: Mutex::new(Vec::new()),
        }
    }

    fn dispatch(&self, work: Work) {
        self.shared.queue.lock().push_back(work);
        if self.shared.idle.load(Ordering::Acquire) > 0 {
            self.shared.available.notify_one();
            return;
        }
        if self.shared.live.load(Ordering::Acquire) < self.max_threads {
            self.spawn_worker();
        } else {
            // All workers busy; one of them will pick the job up.
            self.shared.available.notify_one();
        }
    }

    fn spawn_worker(&self) {
        self.shared.live.fetch_add(1, Ordering::AcqRel);
        let shared = Arc::clone(&self.shared);
        match self
            .factory
            .spawn("worker", Box::new(move || worker_loop(shared)))
        {
            Ok(handle) => {
                let mut handles = self.handles.lock();
                handles.retain(|h| !h.is_finished());
                handles.push(handle);
            },
            Err(err) => {
                self.shared.live.fetch_sub(1, Ordering::AcqRel);
                tracing::error!(error = %err, "failed to spawn worker thread");
            },
        }
    }

    fn join_all(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.available.notify_all();
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
    }
}

fn worker_loop(shared: Arc<WorkerShared>) {
    loop {
        let mut queue = shared.queue.lock();
        let work = loop {
            if let Some(work) = queue.pop_front() {
                break Some(work);
            }
            if shared.stop.load(Ordering::Acquire) {
                break None;
            }
            shared.idle.fetch_add(1, Ordering::AcqRel);
            let timed_out = shared
                .available
                .wait_for(&mut queue, WORKER_IDLE_TIMEOUT)
                .timed_out();
            shared.idle.fetch_sub(1, Ordering::AcqRel);
            if timed_out && queue.is_empty() && !shared.stop.load(Ordering::Acquire) {
                // Nothing to do for a while; retire.
                break None;
            }
        };
        let Some(work) = work else {
            // Leave the thread count while still holding the queue lock, so
            // a concurrent dispatch sees an accurate count and can spawn a
            // replacement for work arriving right now.
            shared.live.fetch_sub(1, Ordering::AcqRel);
            return;
        };
        drop(queue);
        if catch_unwind(AssertUnwindSafe(work)).is_err() {
            tracing::error!("background job panicked");
        }
    }
}

/// The single background thread coordinating the task stack, the timer heap,
/// and worker dispatch.
pub(crate) struct Controller {
    stack: Arc<TaskStack>,
    clock: Arc<AsynchronousClock>,
    stop: AtomicBool,
    parker: Parker,
    workers: WorkerPool,
}

impl Controller {
    pub(crate) fn new(
        stack: Arc<TaskStack>,
        clock: Arc<AsynchronousClock>,
        factory: Arc<dyn ThreadFactory>,
        max_threads: usize,
    ) -> Self {
        Self {
            stack,
            clock,
            stop: AtomicBool::new(false),
            parker: Parker::new(),
            workers: WorkerPool::new(factory, max_threads),
        }
    }

    pub(crate) fn wake(&self) {
        self.parker.unpark();
    }

    pub(crate) fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.parker.unpark();
    }

    /// Main loop; runs on the controller thread until stopped.
    pub(crate) fn run(&self) {
        let mut timers: BinaryHeap<Reverse<TimerEntry>> = BinaryHeap::new();
        let mut seq: u64 = 0;

        loop {
            for task in self.stack.take() {
                match task {
                    TaskKind::Immediate(work) => self.workers.dispatch(work),
                    TaskKind::Scheduled(job) => {
                        if !job.is_cancelled() {
                            let fire_at_nanos =
                                self.clock.now_nanos() + job.delay().as_nanos() as u64;
                            timers.push(Reverse(TimerEntry { fire_at_nanos, seq, job }));
                            seq += 1;
                        }
                    },
                    TaskKind::Bootstrap => {},
                }
            }

            let now = self.clock.now_nanos();
            while let Some(Reverse(entry)) = timers.pop() {
                if entry.fire_at_nanos > now {
                    timers.push(Reverse(entry));
                    break;
                }
                if entry.job.is_cancelled() {
                    continue;
                }
                let job = Arc::clone(&entry.job);
                self.workers.dispatch(Box::new(move || job.run()));
                timers.push(Reverse(TimerEntry {
                    fire_at_nanos: entry.fire_at_nanos + entry.job.delay().as_nanos() as u64,
                    seq,
                    job: entry.job,
                }));
                seq += 1;
            }

            if self.stop.load(Ordering::Acquire) {
                break;
            }

            let until_next_fire = timers.peek().map(|Reverse(entry)| {
                Duration::from_nanos(entry.fire_at_nanos.saturating_sub(self.clock.now_nanos()))
            });
            self.parker.park(until_next_fire);
        }

        // Run what is left, then wind the workers down.
        for task in self.stack.take() {
            if let TaskKind::Immediate(work) = task {
                self.workers.dispatch(work);
            }
        }
        self.workers.join_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::DefaultThreadFactory;
    use std::thread;

    fn controller_fixture() -> (Arc<Controller>, Arc<AsynchronousClock>) {
        let clock = Arc::new(AsynchronousClock::new());
        clock.sample();
        let controller = Arc::new(Controller::new(
            Arc::new(TaskStack::new()),
            clock.clone(),
            Arc::new(DefaultThreadFactory::new()),
            2,
        ));
        (controller, clock)
    }

    #[test]
    fn test_immediate_work_runs_on_a_worker() {
        let (controller, _clock) = controller_fixture();
        let runner = Arc::clone(&controller);
        let thread = thread::spawn(move || runner.run());

        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        controller.stack.push(TaskKind::Immediate(Box::new(move || {
            flag.store(true, Ordering::Release);
        })));
        controller.wake();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !done.load(Ordering::Acquire) {
            assert!(std::time::Instant::now() < deadline, "job never ran");
            thread::sleep(Duration::from_millis(1));
        }

        controller.stop();
        thread.join().unwrap();
    }

    #[test]
    fn test_panicking_job_does_not_stop_dispatch() {
        let (controller, _clock) = controller_fixture();
        let runner = Arc::clone(&controller);
        let thread = thread::spawn(move || runner.run());

        controller
            .stack
            .push(TaskKind::Immediate(Box::new(|| panic!("job failure"))));
        controller.wake();

        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        controller.stack.push(TaskKind::Immediate(Box::new(move || {
            flag.store(true, Ordering::Release);
        })));
        controller.wake();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !done.load(Ordering::Acquire) {
            assert!(std::time::Instant::now() < deadline, "follow-up job never ran");
            thread::sleep(Duration::from_millis(1));
        }

        controller.stop();
        thread.join().unwrap();
    }
}
