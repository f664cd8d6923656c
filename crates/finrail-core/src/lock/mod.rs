//! Distributed mutual exclusion over named resources.
//!
//! Locks live in the shared key-value store as `resource -> token` entries
//! with a TTL, so a crashed holder can never block other instances for
//! longer than its TTL. All mutation goes through the store's atomic
//! conditional primitives: acquisition is "set if absent", release and
//! extension compare the stored token first and are therefore safe against
//! a lock that expired and was reacquired by someone else.
//!
//! Acquisition failure is a normal outcome, not an error: callers get
//! `None` (or [`LockError::ResourceBusy`] from the scoped variant) and make
//! a business decision about it.

mod manager;


use thiserror::Error;

pub use manager::{LockConfig, LockManager};

/// Errors from lock operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LockError {
    /// The backing store failed.
    #[error("lock store error: {0}")]
    Store(#[from] crate::kv::KvError),

    /// The lock could not be acquired within the retry budget.
    #[error("resource busy: {resource}")]
    ResourceBusy {
        /// Resource key that stayed locked.
        resource: String,
    },
}

/// Errors from scoped execution under a lock.
#[derive(Debug, Error)]
pub enum WithLockError<E> {
    /// Acquiring or talking to the lock store failed.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// The caller's unit of work failed. The lock was still released.
    #[error("operation failed: {0}")]
    Work(E),
}
