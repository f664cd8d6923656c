//! Backing key-value store contract for the lock manager.
//!
//! Distributed locks need three atomic primitives from their shared store:
//!
//! - set a key only if it is absent, with a millisecond expiry
//! - delete a key only if it still holds an expected value
//! - reset a key's expiry only if it still holds an expected value
//!
//! [`KvStore`] captures exactly that contract. There are two implementations,
//! chosen once at construction from configuration:
//!
//! - [`MemoryKvStore`]: a process-local map with lazy expiry. The fallback
//!   for single-instance deployments and the double used throughout tests.
//! - [`RespKvStore`]: a minimal RESP2 client for any Redis-protocol server,
//!   the store that actually makes the locks distributed.
//!
//! Nothing else in the crate writes lock keys; the lock manager is the sole
//! consumer of this trait.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;

mod memory;
mod resp;

#[cfg(test)]
mod tests;

pub use memory::MemoryKvStore;
pub use resp::RespKvStore;

/// Boxed future returned by [`KvStore`] methods, keeping the trait
/// object-safe.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors surfaced by a backing store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KvError {
    /// I/O failure talking to the store.
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The store replied with something outside the protocol.
    #[error("store protocol violation: {0}")]
    Protocol(String),

    /// The store reported an error of its own.
    #[error("store error reply: {0}")]
    Server(String),
}

/// Atomic conditional operations over a shared key-value store.
///
/// All methods are atomic with respect to concurrent callers against the
/// same store, including callers in other processes.
pub trait KvStore: Send + Sync {
    /// Sets `key = value` with expiry `ttl` only if `key` is absent.
    ///
    /// Returns `true` if the key was set, `false` if it already existed.
    fn set_nx_px<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<bool, KvError>>;

    /// Returns the current value of `key`, or `None` if absent or expired.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, KvError>>;

    /// Deletes `key` only if it currently holds `expected`.
    ///
    /// Returns `true` if the key was deleted.
    fn del_if_equal<'a>(
        &'a self,
        key: &'a str,
        expected: &'a str,
    ) -> BoxFuture<'a, Result<bool, KvError>>;

    /// Resets the expiry of `key` to `ttl` only if it currently holds
    /// `expected`.
    ///
    /// Returns `true` if the expiry was reset.
    fn pexpire_if_equal<'a>(
        &'a self,
        key: &'a str,
        expected: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<bool, KvError>>;
}
