//! Internal slot queues
//!
//! - [`LiveQueue`]: blocking hand-off of slots awaiting a claim.
//! - [`DeadQueue`]: lock-free stack of slots awaiting (re)allocation or
//!   deallocation, drained by background workers.

mod dead;
mod live;

pub(crate) use dead::DeadQueue;
pub(crate) use live::LiveQueue;
