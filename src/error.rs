//! Error types for pool operations

use std::error::Error;
use std::fmt;

/// Boxed error type produced by user-supplied allocators.
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// Result type for pool operations
pub type PoolResult<T> = std::result::Result<T, PoolError>;

/// Pool operation errors
#[derive(Debug)]
pub enum PoolError {
    /// Invalid configuration or argument
    InvalidConfig {
        /// What was wrong with the input
        message: String,
    },

    /// The pool has been shut down
    PoolClosed,

    /// An operation was attempted in a state that does not permit it
    IllegalState {
        /// Which state rule was violated
        message: String,
    },

    /// The user allocator failed; the slot has been re-queued for retry
    AllocationFailed {
        /// The allocator's error
        source: BoxError,
    },
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig { message } => {
                write!(f, "Invalid configuration: {message}")
            },
            Self::PoolClosed => {
                write!(f, "Pool has been shut down")
            },
            Self::IllegalState { message } => {
                write!(f, "Illegal state: {message}")
            },
            Self::AllocationFailed { source } => {
                write!(f, "Allocation failed: {source}")
            },
        }
    }
}

impl Error for PoolError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::AllocationFailed { source } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl PoolError {
    /// Create an invalid configuration error
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig { message: message.into() }
    }

    /// Create an illegal state error
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState { message: message.into() }
    }

    /// Create an allocation failure error
    pub fn allocation_failed(source: BoxError) -> Self {
        Self::AllocationFailed { source }
    }

    /// Check whether this error is an allocation failure
    pub fn is_allocation_failure(&self) -> bool {
        matches!(self, Self::AllocationFailed { .. })
    }
}
