//! # tidepool
//!
//! A thread-based object pool for expensive, reusable objects: database
//! connections, byte buffers, thread-bound resources. Callers claim an
//! object with a time-bounded wait, use it, and drop the guard to hand it
//! back. Everything slow happens off the claim path: allocation,
//! revalidation, reallocation, and teardown all run on a shared background
//! scheduler.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::time::Duration;
//! use tidepool::{Allocator, BoxError, Pool, PoolConfig, TimeExpiration};
//!
//! struct ConnectionAllocator;
//!
//! impl Allocator<String> for ConnectionAllocator {
//!     fn allocate(&self) -> Result<String, BoxError> {
//!         Ok("connected".to_string())
//!     }
//! }
//!
//! let pool = Pool::new(
//!     PoolConfig::new(ConnectionAllocator)
//!         .with_size(4)
//!         .with_expiration(TimeExpiration::after(Duration::from_secs(300))?),
//! )?;
//!
//! if let Some(conn) = pool.claim(Duration::from_secs(1))? {
//!     assert_eq!(*conn, "connected");
//! } // returned to the pool here
//!
//! pool.shutdown().await_done(Duration::from_secs(10));
//! # Ok::<(), tidepool::PoolError>(())
//! ```
//!
//! ## Architecture
//!
//! - Every pooled object lives in a slot with an atomic state machine:
//!   live, claimed, dead, or tombstoned.
//! - Live slots wait in a blocking hand-off queue; dead slots wait in a
//!   lock-free stack for a background worker to reallocate or retire them.
//! - A [`BackgroundScheduler`], shareable across pools, owns the worker
//!   threads, a timer for periodic jobs, and a coarse ~10 ms monotonic
//!   clock that makes timestamp reads on the claim path a single load.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod clock;
mod config;
mod error;
mod expiration;
mod pool;
mod queue;
mod scheduler;
mod slot;
mod stats;
mod traits;

pub use crate::clock::{MonotonicClock, PreciseClock};
pub use crate::config::PoolConfig;
pub use crate::error::{BoxError, PoolError, PoolResult};
pub use crate::expiration::{Expiration, SlotInfo, TimeExpiration};
pub use crate::pool::{Completion, Pool, Pooled};
pub use crate::scheduler::{BackgroundScheduler, ScheduledJobHandle};
pub use crate::stats::{PoolStats, PoolStatsSnapshot};
pub use crate::traits::{Allocator, DefaultThreadFactory, ThreadFactory};
