//! Shared background scheduler
//!
//! A [`BackgroundScheduler`] amortises background machinery across pool
//! instances: one coarse monotonic clock fed by a timekeeper thread, one
//! controller thread draining a lock-free task stack, and a bounded pool of
//! worker threads running the actual jobs.
//!
//! Thread lifecycle is reference counted. The first reference starts the
//! timekeeper; the controller starts lazily on the first enqueue (the task
//! stack's bootstrap sentinel runs inline in the pusher); the last reference
//! stops and joins everything.

mod controller;
mod task;

pub use task::ScheduledJobHandle;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::clock::{AsynchronousClock, MonotonicClock, TimeKeeper};
use crate::error::{PoolError, PoolResult};
use crate::scheduler::controller::Controller;
use crate::scheduler::task::{ScheduledJob, TaskKind, TaskStack};
use crate::traits::{DefaultThreadFactory, ThreadFactory};

static DEFAULT_INSTANCE: Lazy<Mutex<Option<BackgroundScheduler>>> =
    Lazy::new(|| Mutex::new(None));

#[derive(Default)]
struct Lifecycle {
    keeper: Option<(TimeKeeper, JoinHandle<()>)>,
    controller: Option<(Arc<Controller>, JoinHandle<()>)>,
}

struct SchedulerShared {
    stack: Arc<TaskStack>,
    clock: Arc<AsynchronousClock>,
    factory: Arc<dyn ThreadFactory>,
    max_threads: usize,
    /// Mutated only under the lifecycle lock; read lock-free on the enqueue
    /// path.
    references: AtomicUsize,
    lifecycle: Mutex<Lifecycle>,
}

/// Background thread pool and time source shared among pool instances.
///
/// Cheap to clone; clones refer to the same scheduler.
#[derive(Clone)]
pub struct BackgroundScheduler {
    shared: Arc<SchedulerShared>,
}

impl BackgroundScheduler {
    /// Create a scheduler with the given thread factory and worker thread
    /// cap. The cap must be at least one.
    pub fn new(factory: Arc<dyn ThreadFactory>, max_threads: usize) -> PoolResult<Self> {
        if max_threads == 0 {
            return Err(PoolError::invalid_config("max_threads must be at least 1"));
        }
        Ok(Self::build(factory, max_threads))
    }

    /// Create a scheduler with the default thread factory and a worker cap
    /// equal to the available parallelism.
    pub fn with_defaults() -> Self {
        let max_threads = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self::build(Arc::new(DefaultThreadFactory::new()), max_threads)
    }

    fn build(factory: Arc<dyn ThreadFactory>, max_threads: usize) -> Self {
        Self {
            shared: Arc::new(SchedulerShared {
                stack: Arc::new(TaskStack::new()),
                clock: Arc::new(AsynchronousClock::new()),
                factory,
                max_threads,
                references: AtomicUsize::new(0),
                lifecycle: Mutex::new(Lifecycle::default()),
            }),
        }
    }

    /// The process-wide default scheduler, created lazily on first access.
    pub fn default_instance() -> Self {
        DEFAULT_INSTANCE
            .lock()
            .get_or_insert_with(Self::with_defaults)
            .clone()
    }

    /// Replace the process-wide default scheduler.
    ///
    /// Pools already bound to the previous default keep using it.
    pub fn set_default_instance(scheduler: BackgroundScheduler) {
        *DEFAULT_INSTANCE.lock() = Some(scheduler);
    }

    /// The scheduler's asynchronous monotonic time source.
    ///
    /// Reads are a single atomic load at roughly 10 ms precision; the value
    /// only advances while the scheduler holds at least one reference.
    pub fn time_source(&self) -> Arc<dyn MonotonicClock> {
        self.shared.clock.clone()
    }

    pub(crate) fn async_clock(&self) -> Arc<AsynchronousClock> {
        self.shared.clock.clone()
    }

    /// The factory used for all of this scheduler's threads.
    pub fn thread_factory(&self) -> Arc<dyn ThreadFactory> {
        self.shared.factory.clone()
    }

    /// Maximum number of worker threads.
    pub fn max_threads(&self) -> usize {
        self.shared.max_threads
    }

    /// Pin the scheduler's background threads.
    ///
    /// Pools take a reference for their lifetime; embedders running jobs
    /// directly must hold one around their use. The first reference starts
    /// the timekeeper thread.
    pub fn increment_references(&self) {
        let mut lifecycle = self.shared.lifecycle.lock();
        let current = self.shared.references.load(Ordering::Acquire);
        self.shared.references.store(current + 1, Ordering::Release);
        if current == 0 {
            let keeper = TimeKeeper::new(self.shared.clock.clone());
            let runner = keeper.clone();
            match self
                .shared
                .factory
                .spawn("timekeeper", Box::new(move || runner.run()))
            {
                Ok(handle) => lifecycle.keeper = Some((keeper, handle)),
                Err(err) => {
                    tracing::error!(error = %err, "failed to start timekeeper thread");
                },
            }
        }
    }

    /// Drop a reference. The last reference stops and joins the controller
    /// and the timekeeper.
    pub fn decrement_references(&self) {
        let taken = {
            let mut lifecycle = self.shared.lifecycle.lock();
            let current = self.shared.references.load(Ordering::Acquire);
            debug_assert!(current > 0, "unbalanced decrement_references");
            if current == 0 {
                return;
            }
            self.shared.references.store(current - 1, Ordering::Release);
            if current != 1 {
                return;
            }
            (lifecycle.keeper.take(), lifecycle.controller.take())
        };

        // Joins happen outside the lifecycle lock: a worker finishing its
        // last job may be blocked on that lock in ensure_controller, and the
        // controller cannot exit before its workers do.
        let (keeper, controller) = taken;
        if let Some((ctrl, handle)) = controller {
            ctrl.stop();
            if handle.join().is_err() {
                tracing::error!("controller thread panicked during shutdown");
            }
        }
        if let Some((keeper, handle)) = keeper {
            keeper.stop();
            if handle.join().is_err() {
                tracing::error!("timekeeper thread panicked during shutdown");
            }
        }
    }

    /// Run `work` once on a background worker thread.
    pub fn submit(&self, work: impl FnOnce() + Send + 'static) -> PoolResult<()> {
        self.enqueue(TaskKind::Immediate(Box::new(work)))
    }

    /// Run `work` repeatedly with a fixed delay between the scheduled fire
    /// times. The returned handle cancels future fires.
    pub fn schedule_with_fixed_delay(
        &self,
        work: impl Fn() + Send + Sync + 'static,
        delay: Duration,
    ) -> PoolResult<ScheduledJobHandle> {
        if delay.is_zero() {
            return Err(PoolError::invalid_config("schedule delay must be non-zero"));
        }
        let job = Arc::new(ScheduledJob::new(Box::new(work), delay));
        self.enqueue(TaskKind::Scheduled(Arc::clone(&job)))?;
        Ok(ScheduledJobHandle::new(job))
    }

    fn enqueue(&self, kind: TaskKind) -> PoolResult<()> {
        if self.shared.references.load(Ordering::Acquire) == 0 {
            return Err(PoolError::illegal_state(
                "background scheduler is not running; reference count is zero",
            ));
        }
        if self.shared.stack.push(kind) {
            // We displaced the bootstrap sentinel: the controller is either
            // not running yet or parked. Run the bootstrap inline.
            self.ensure_controller();
        }
        Ok(())
    }

    fn ensure_controller(&self) {
        let mut lifecycle = self.shared.lifecycle.lock();
        if self.shared.references.load(Ordering::Acquire) == 0 {
            // Raced with the last decrement; the task stays queued for the
            // next start.
            return;
        }
        if let Some((ctrl, handle)) = &lifecycle.controller {
            if !handle.is_finished() {
                ctrl.wake();
                return;
            }
        }
        let ctrl = Arc::new(Controller::new(
            Arc::clone(&self.shared.stack),
            self.shared.clock.clone(),
            self.shared.factory.clone(),
            self.shared.max_threads,
        ));
        let runner = Arc::clone(&ctrl);
        match self
            .shared
            .factory
            .spawn("controller", Box::new(move || runner.run()))
        {
            Ok(handle) => lifecycle.controller = Some((ctrl, handle)),
            Err(err) => {
                tracing::error!(error = %err, "failed to start controller thread");
            },
        }
    }
}
