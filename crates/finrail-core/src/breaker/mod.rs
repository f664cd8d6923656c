//! Per-service circuit breakers.
//!
//! A circuit isolates repeated failures of one named service so cascading
//! retries cannot amplify an outage.
//!
//! ```text
//! CLOSED --(threshold failures in window)--> OPEN
//! OPEN --(reset timeout elapses)--> HALF_OPEN
//! HALF_OPEN --(success threshold met)--> CLOSED
//! HALF_OPEN --(any failure)--> OPEN
//! ```
//!
//! Rejections while open happen without invoking the wrapped call and do
//! not count as new failures. Every transition is persisted to the audit
//! log and broadcast through the notifier.

mod circuit;
mod registry;


use thiserror::Error;

pub use circuit::{Circuit, CircuitConfig, CircuitState, Transition};
pub use registry::CircuitBreakerRegistry;

/// Errors surfaced by guarded execution.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The circuit is open; the call was rejected without executing.
    #[error("circuit open for service {service}")]
    CircuitOpen {
        /// Service whose circuit rejected the call.
        service: String,
    },

    /// The wrapped call itself failed.
    #[error("operation failed: {0}")]
    Operation(E),
}
