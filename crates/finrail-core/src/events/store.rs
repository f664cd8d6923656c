//! `SQLite`-backed append-only event store.
//!
//! Version assignment is the correctness-critical part: the next version for
//! an aggregate is computed and the row inserted inside one immediate
//! transaction, with `UNIQUE (aggregate_type, aggregate_id, version)` as the
//! backstop and bounded retry on conflict. Appenders in other processes race
//! on the constraint, lose, and retry with a fresh version; a version is
//! never assigned twice and never skipped.

// SQLite returns i64 for row IDs and counts, but they're always non-negative.
// Mutex poisoning indicates a panic in another thread, which is unrecoverable.
#![allow(
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation,
    clippy::missing_panics_doc
)]

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OpenFlags, TransactionBehavior, params};
use tracing::debug;
use uuid::Uuid;

use super::record::{EventDraft, FinancialEvent};
use super::reducer::{self, AggregateState};
use super::EventStoreError;
use crate::notify::{CoreNotification, Notifier};

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// How many times an append retries after losing a version race.
const VERSION_CONFLICT_RETRIES: u32 = 5;

/// Statistics about the event store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventStoreStats {
    /// Total number of stored events.
    pub event_count: u64,

    /// Number of distinct aggregates with at least one event.
    pub aggregate_count: u64,

    /// Database file size in bytes.
    pub db_size_bytes: u64,
}

/// Append-only, versioned store of financial events.
///
/// This is the system of record for aggregate history: current state is
/// always derived by replay, never stored as mutable rows.
pub struct EventStore {
    conn: Arc<Mutex<Connection>>,
    notifier: Arc<dyn Notifier>,
}

impl EventStore {
    /// Opens or creates the event store at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>, notifier: Arc<dyn Notifier>) -> Result<Self, EventStoreError> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            notifier,
        })
    }

    /// Creates an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory(notifier: Arc<dyn Notifier>) -> Result<Self, EventStoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            notifier,
        })
    }

    /// Appends one event to an aggregate's stream.
    ///
    /// The assigned version is `max(existing) + 1` for the aggregate,
    /// computed and inserted atomically. On success the stored event is
    /// broadcast through the notifier and returned.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::VersionConflict`] if the version race is
    /// lost more times than the retry budget allows, or a database error if
    /// the write fails outright. Append failures are fatal to the enclosing
    /// operation: a financial state change must not report success without
    /// its audit event.
    pub fn append(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        draft: EventDraft,
    ) -> Result<FinancialEvent, EventStoreError> {
        let payload = serde_json::to_string(&draft.payload)?;
        let metadata = serde_json::to_string(&draft.metadata)?;

        for attempt in 0..=VERSION_CONFLICT_RETRIES {
            let event_id = Uuid::new_v4().to_string();
            let recorded_at = Utc::now();

            let result = self.try_insert(
                aggregate_type,
                aggregate_id,
                &draft,
                &event_id,
                &payload,
                &metadata,
                recorded_at,
            );

            match result {
                Ok(version) => {
                    let event = FinancialEvent {
                        id: event_id,
                        event_type: draft.event_type.clone(),
                        aggregate_type: aggregate_type.to_string(),
                        aggregate_id: aggregate_id.to_string(),
                        user_id: draft.user_id.clone(),
                        payload: draft.payload,
                        metadata: draft.metadata,
                        version,
                        recorded_at,
                    };
                    self.notifier.notify(CoreNotification::EventAppended {
                        event_id: event.id.clone(),
                        event_type: event.event_type.as_str().to_string(),
                        aggregate_type: event.aggregate_type.clone(),
                        aggregate_id: event.aggregate_id.clone(),
                        version: event.version,
                    });
                    return Ok(event);
                },
                Err(err) if is_unique_violation(&err) => {
                    // Lost the version race to a concurrent appender.
                    debug!(
                        aggregate_type,
                        aggregate_id, attempt, "version conflict on append, retrying"
                    );
                },
                Err(err) => return Err(EventStoreError::Database(err)),
            }
        }

        Err(EventStoreError::VersionConflict {
            aggregate_type: aggregate_type.to_string(),
            aggregate_id: aggregate_id.to_string(),
            attempts: VERSION_CONFLICT_RETRIES + 1,
        })
    }

    /// Computes the next version and inserts in a single transaction.
    #[allow(clippy::too_many_arguments)]
    fn try_insert(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        draft: &EventDraft,
        event_id: &str,
        payload: &str,
        metadata: &str,
        recorded_at: DateTime<Utc>,
    ) -> Result<u64, rusqlite::Error> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let version: i64 = tx.query_row(
            "SELECT COALESCE(MAX(version), 0) + 1
             FROM financial_events
             WHERE aggregate_type = ?1 AND aggregate_id = ?2",
            params![aggregate_type, aggregate_id],
            |row| row.get(0),
        )?;

        tx.execute(
            "INSERT INTO financial_events
                 (id, event_type, aggregate_type, aggregate_id, user_id, payload, metadata, version, recorded_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                event_id,
                draft.event_type.as_str(),
                aggregate_type,
                aggregate_id,
                draft.user_id,
                payload,
                metadata,
                version,
                recorded_at.timestamp_millis(),
            ],
        )?;

        tx.commit()?;
        Ok(version as u64)
    }

    /// Returns an aggregate's full event stream, ascending by version.
    ///
    /// The result is finite and re-queryable from scratch.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_events(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<Vec<FinancialEvent>, EventStoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, event_type, aggregate_type, aggregate_id, user_id, payload, metadata, version, recorded_at_ms
             FROM financial_events
             WHERE aggregate_type = ?1 AND aggregate_id = ?2
             ORDER BY version ASC",
        )?;
        let events = stmt
            .query_map(params![aggregate_type, aggregate_id], event_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    /// Returns all events of `event_type` recorded in `[start, end)`,
    /// oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn query_by_type(
        &self,
        event_type: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<FinancialEvent>, EventStoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, event_type, aggregate_type, aggregate_id, user_id, payload, metadata, version, recorded_at_ms
             FROM financial_events
             WHERE event_type = ?1 AND recorded_at_ms >= ?2 AND recorded_at_ms < ?3
             ORDER BY recorded_at_ms ASC, version ASC",
        )?;
        let events = stmt
            .query_map(
                params![event_type, start.timestamp_millis(), end.timestamp_millis()],
                event_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    /// Rebuilds an aggregate's current state by replaying its events.
    ///
    /// Replay is pure and deterministic: the same stream always produces
    /// the same state.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream cannot be read.
    pub fn reconstruct(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<AggregateState, EventStoreError> {
        let events = self.get_events(aggregate_type, aggregate_id)?;
        Ok(reducer::replay(aggregate_type, aggregate_id, &events))
    }

    /// Gets statistics about the store.
    ///
    /// # Errors
    ///
    /// Returns an error if statistics cannot be gathered.
    pub fn stats(&self) -> Result<EventStoreStats, EventStoreError> {
        let conn = self.conn.lock().unwrap();

        let event_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM financial_events", [], |row| {
                row.get(0)
            })?;
        let aggregate_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM (SELECT DISTINCT aggregate_type, aggregate_id FROM financial_events)",
            [],
            |row| row.get(0),
        )?;
        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;

        Ok(EventStoreStats {
            event_count: event_count as u64,
            aggregate_count: aggregate_count as u64,
            db_size_bytes: (page_count * page_size) as u64,
        })
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn event_row(row: &rusqlite::Row<'_>) -> Result<FinancialEvent, rusqlite::Error> {
    let event_type: String = row.get(1)?;
    let payload: String = row.get(5)?;
    let metadata: String = row.get(6)?;
    Ok(FinancialEvent {
        id: row.get(0)?,
        event_type: event_type.into(),
        aggregate_type: row.get(2)?,
        aggregate_id: row.get(3)?,
        user_id: row.get(4)?,
        payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
        version: row.get::<_, i64>(7)? as u64,
        recorded_at: Utc
            .timestamp_millis_opt(row.get::<_, i64>(8)?)
            .single()
            .unwrap_or_default(),
    })
}
