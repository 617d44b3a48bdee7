//! Collaborator interfaces implemented by user code
//!
//! The pool core stays generic over how objects come into being and how
//! threads are created. [`Allocator`] builds and tears down the pooled
//! objects; [`ThreadFactory`] creates the scheduler's background threads.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{Builder, JoinHandle};

use crate::error::BoxError;

/// Builds and tears down pooled objects.
///
/// `allocate` runs on background worker threads, never on the claim path.
/// Failures are isolated to the slot being allocated and surfaced to the next
/// claimer; the pool itself stays live.
pub trait Allocator<T>: Send + Sync {
    /// Construct a new object for the pool.
    fn allocate(&self) -> Result<T, BoxError>;

    /// Release an object that is leaving the pool.
    ///
    /// Best-effort: panics are caught and logged, and never block shutdown.
    /// The default drops the object.
    fn deallocate(&self, obj: T) {
        drop(obj);
    }
}

/// Creates the scheduler's background threads.
///
/// Naming is the factory's concern; the scheduler passes a role hint such as
/// `"worker"` or `"timekeeper"`.
pub trait ThreadFactory: Send + Sync {
    /// Spawn a thread running `work`.
    fn spawn(
        &self,
        role: &str,
        work: Box<dyn FnOnce() + Send + 'static>,
    ) -> io::Result<JoinHandle<()>>;
}

/// Default factory naming threads `tidepool-<role>-<n>`.
pub struct DefaultThreadFactory {
    counter: AtomicU64,
}

impl DefaultThreadFactory {
    /// Create a new factory with its own name counter.
    pub fn new() -> Self {
        Self { counter: AtomicU64::new(0) }
    }
}

impl Default for DefaultThreadFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadFactory for DefaultThreadFactory {
    fn spawn(
        &self,
        role: &str,
        work: Box<dyn FnOnce() + Send + 'static>,
    ) -> io::Result<JoinHandle<()>> {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        Builder::new()
            .name(format!("tidepool-{role}-{seq}"))
            .spawn(work)
    }
}
