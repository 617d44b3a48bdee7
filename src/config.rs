//! Pool configuration

use crate::expiration::{Expiration, TimeExpiration};
use crate::scheduler::BackgroundScheduler;
use crate::traits::Allocator;

/// Configuration for a [`Pool`](crate::Pool).
///
/// Only the allocator is required. The defaults: ten slots, a jittered
/// eight-to-ten-minute [`TimeExpiration`], and the process-wide default
/// [`BackgroundScheduler`].
pub struct PoolConfig<T> {
    pub(crate) size: usize,
    pub(crate) allocator: Box<dyn Allocator<T>>,
    pub(crate) expiration: Box<dyn Expiration<T>>,
    pub(crate) scheduler: BackgroundScheduler,
}

impl<T: Send + 'static> PoolConfig<T> {
    /// Start a configuration from the required allocator.
    pub fn new(allocator: impl Allocator<T> + 'static) -> Self {
        Self {
            size: 10,
            allocator: Box::new(allocator),
            expiration: Box::new(TimeExpiration::default_window()),
            scheduler: BackgroundScheduler::default_instance(),
        }
    }

    /// Set the target number of pooled objects. Must be at least one;
    /// validated when the pool is built.
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Replace the expiration policy.
    pub fn with_expiration(mut self, expiration: impl Expiration<T> + 'static) -> Self {
        self.expiration = Box::new(expiration);
        self
    }

    /// Bind the pool to a specific scheduler instead of the process default.
    pub fn with_scheduler(mut self, scheduler: BackgroundScheduler) -> Self {
        self.scheduler = scheduler;
        self
    }
}
