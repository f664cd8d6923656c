//! Cancellable scheduled tasks.
//!
//! Every timer in this crate (lock auto-extension, lock sweep, circuit reset)
//! is a spawned Tokio task whose handle is held by a [`TaskGuard`]. Dropping
//! the guard aborts the task, so cancellation is tied to ownership rather
//! than to manual bookkeeping: a lock release drops its extender guard, a
//! breaker transition drops its reset guard, and nothing is left ticking.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;


/// Owns a spawned task and aborts it when dropped or cancelled.
#[derive(Debug)]
pub struct TaskGuard {
    handle: JoinHandle<()>,
}

impl TaskGuard {
    /// Wraps an existing join handle.
    #[must_use]
    pub const fn new(handle: JoinHandle<()>) -> Self {
        Self { handle }
    }

    /// Aborts the task immediately.
    pub fn cancel(self) {
        self.handle.abort();
    }

    /// Returns `true` if the task has run to completion or was aborted.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Runs `fut` after `delay`, unless the guard is dropped first.
pub fn spawn_after<F>(delay: Duration, fut: F) -> TaskGuard
where
    F: Future<Output = ()> + Send + 'static,
{
    TaskGuard::new(tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        fut.await;
    }))
}

/// Runs `tick` every `period` until it returns `false` or the guard is
/// dropped. The first tick fires after one full period, not immediately.
pub fn spawn_periodic<F, Fut>(period: Duration, mut tick: F) -> TaskGuard
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = bool> + Send,
{
    TaskGuard::new(tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        // The first interval tick completes immediately; consume it so the
        // caller's closure only runs on real period boundaries.
        interval.tick().await;
        loop {
            interval.tick().await;
            if !tick().await {
                break;
            }
        }
    }))
}
