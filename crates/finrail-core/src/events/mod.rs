//! Append-only financial event store.
//!
//! This module is the system of record for everything that happens to a
//! financial aggregate. Events are immutable, versioned per aggregate, and
//! never deleted; the current state of an investment or wallet is always
//! derived by folding its event stream, never read from a mutable row.
//!
//! ```text
//! append --> financial_events (versioned, gapless per aggregate)
//!                 |
//!                 v
//! get_events --> reducer::replay --> AggregateState
//! ```
//!
//! # Key concepts
//!
//! - **Aggregate**: one financial entity, addressed by
//!   `(aggregate_type, aggregate_id)`.
//! - **Version**: position in the aggregate's stream, gapless from 1.
//! - **Compensating event**: corrections append new events (for example a
//!   cancellation) rather than touching history.

mod record;
mod reducer;
mod store;

#[cfg(test)]
mod tests;

use thiserror::Error;

pub use record::{EventDraft, EventType, FinancialEvent};
pub use reducer::{AggregateState, apply_event, replay};
pub use store::{EventStore, EventStoreStats};

/// Errors that can occur during event store operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EventStoreError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O error during database operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload or metadata could not be serialized.
    #[error("payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Concurrent appenders exhausted the version-conflict retry budget.
    #[error(
        "version conflict for {aggregate_type}/{aggregate_id} after {attempts} attempts"
    )]
    VersionConflict {
        /// Aggregate type of the contested stream.
        aggregate_type: String,
        /// Aggregate id of the contested stream.
        aggregate_id: String,
        /// Number of append attempts made.
        attempts: u32,
    },
}
