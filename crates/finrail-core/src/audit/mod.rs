//! Durable audit log for lock history and circuit transitions.
//!
//! Two append-mostly tables back the operational history of the resilience
//! layer: one row per lock acquisition attempt (successful or not) and one
//! row per circuit state transition. Writes here are best-effort by
//! contract: callers log failures and move on, because losing an
//! observability record must never fail the financial operation that
//! produced it. The only update ever applied is stamping `released_at` on a
//! lock history row.

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
use rusqlite::{Connection, OpenFlags, params};
use thiserror::Error;

#[cfg(test)]
mod tests;

/// Schema for the audit database.
const AUDIT_SCHEMA: &str = r"
-- Audit storage for lock history and circuit transitions
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;

CREATE TABLE IF NOT EXISTS lock_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    resource TEXT NOT NULL,
    token TEXT NOT NULL,
    owner TEXT NOT NULL,
    ttl_ms INTEGER NOT NULL,
    acquired INTEGER NOT NULL,
    acquired_at_ms INTEGER NOT NULL,
    released_at_ms INTEGER
);

CREATE INDEX IF NOT EXISTS idx_lock_history_resource
    ON lock_history(resource, acquired_at_ms DESC);

CREATE TABLE IF NOT EXISTS circuit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    service TEXT NOT NULL,
    previous_state TEXT NOT NULL,
    new_state TEXT NOT NULL,
    failure_count INTEGER NOT NULL,
    detail TEXT NOT NULL,
    occurred_at_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_circuit_log_service
    ON circuit_log(service, occurred_at_ms DESC);
CREATE INDEX IF NOT EXISTS idx_circuit_log_time
    ON circuit_log(occurred_at_ms);
";

/// Errors that can occur during audit log operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuditError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O error during database operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Detail payload could not be serialized.
    #[error("detail serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One lock acquisition attempt, durable for audit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHistoryRecord {
    /// Row id (assigned on insert).
    pub id: Option<u64>,

    /// Resource key the attempt targeted.
    pub resource: String,

    /// Token used for the attempt.
    pub token: String,

    /// Identifier of the acquiring instance.
    pub owner: String,

    /// Requested time-to-live in milliseconds.
    pub ttl_ms: u64,

    /// Whether the attempt acquired the lock.
    pub acquired: bool,

    /// When the attempt concluded.
    pub acquired_at: DateTime<Utc>,

    /// When the lock was released, if it was.
    pub released_at: Option<DateTime<Utc>>,
}

impl LockHistoryRecord {
    /// Creates a record for an attempt concluding now.
    #[must_use]
    pub fn new(
        resource: impl Into<String>,
        token: impl Into<String>,
        owner: impl Into<String>,
        ttl_ms: u64,
        acquired: bool,
    ) -> Self {
        Self {
            id: None,
            resource: resource.into(),
            token: token.into(),
            owner: owner.into(),
            ttl_ms,
            acquired,
            acquired_at: Utc::now(),
            released_at: None,
        }
    }
}

/// One circuit state transition, durable for audit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitLogRecord {
    /// Row id (assigned on insert).
    pub id: Option<u64>,

    /// Service whose circuit transitioned.
    pub service: String,

    /// State before the transition.
    pub previous_state: String,

    /// State after the transition.
    pub new_state: String,

    /// Failure count at the time of the transition.
    pub failure_count: u32,

    /// Arbitrary structured detail (last error, operator note).
    pub detail: serde_json::Value,

    /// When the transition happened.
    pub occurred_at: DateTime<Utc>,
}

impl CircuitLogRecord {
    /// Creates a record for a transition happening now.
    #[must_use]
    pub fn new(
        service: impl Into<String>,
        previous_state: impl Into<String>,
        new_state: impl Into<String>,
        failure_count: u32,
        detail: serde_json::Value,
    ) -> Self {
        Self {
            id: None,
            service: service.into(),
            previous_state: previous_state.into(),
            new_state: new_state.into(),
            failure_count,
            detail,
            occurred_at: Utc::now(),
        }
    }
}

/// Append-mostly audit store backed by `SQLite`.
pub struct AuditLog {
    conn: Arc<Mutex<Connection>>,
}

impl AuditLog {
    /// Opens or creates the audit database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch(AUDIT_SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Creates an in-memory audit log for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self, AuditError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(AUDIT_SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Records a lock acquisition attempt.
    ///
    /// # Errors
    ///
    /// Returns an error if the row cannot be inserted.
    pub fn record_lock_attempt(&self, record: &LockHistoryRecord) -> Result<u64, AuditError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO lock_history (resource, token, owner, ttl_ms, acquired, acquired_at_ms, released_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.resource,
                record.token,
                record.owner,
                record.ttl_ms,
                record.acquired,
                record.acquired_at.timestamp_millis(),
                record.released_at.map(|t| t.timestamp_millis()),
            ],
        )?;
        Ok(conn.last_insert_rowid() as u64)
    }

    /// Stamps `released_at` on the open history row for `(resource, token)`.
    ///
    /// Returns `true` if a row was updated.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn mark_lock_released(
        &self,
        resource: &str,
        token: &str,
        released_at: DateTime<Utc>,
    ) -> Result<bool, AuditError> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE lock_history
             SET released_at_ms = ?1
             WHERE resource = ?2 AND token = ?3 AND acquired = 1 AND released_at_ms IS NULL",
            params![released_at.timestamp_millis(), resource, token],
        )?;
        Ok(updated > 0)
    }

    /// Records a circuit state transition.
    ///
    /// # Errors
    ///
    /// Returns an error if the detail cannot be serialized or the row cannot
    /// be inserted.
    pub fn record_circuit_transition(&self, record: &CircuitLogRecord) -> Result<u64, AuditError> {
        let detail = serde_json::to_string(&record.detail)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO circuit_log (service, previous_state, new_state, failure_count, detail, occurred_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.service,
                record.previous_state,
                record.new_state,
                record.failure_count,
                detail,
                record.occurred_at.timestamp_millis(),
            ],
        )?;
        Ok(conn.last_insert_rowid() as u64)
    }

    /// Returns the most recent lock history for `resource`, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn lock_history(
        &self,
        resource: &str,
        limit: u64,
    ) -> Result<Vec<LockHistoryRecord>, AuditError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, resource, token, owner, ttl_ms, acquired, acquired_at_ms, released_at_ms
             FROM lock_history
             WHERE resource = ?1
             ORDER BY acquired_at_ms DESC, id DESC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![resource, limit], |row| {
                Ok(LockHistoryRecord {
                    id: Some(row.get::<_, i64>(0)? as u64),
                    resource: row.get(1)?,
                    token: row.get(2)?,
                    owner: row.get(3)?,
                    ttl_ms: row.get::<_, i64>(4)? as u64,
                    acquired: row.get(5)?,
                    acquired_at: millis_to_utc(row.get::<_, i64>(6)?),
                    released_at: row.get::<_, Option<i64>>(7)?.map(millis_to_utc),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Returns the most recent transitions for `service`, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn circuit_transitions(
        &self,
        service: &str,
        limit: u64,
    ) -> Result<Vec<CircuitLogRecord>, AuditError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, service, previous_state, new_state, failure_count, detail, occurred_at_ms
             FROM circuit_log
             WHERE service = ?1
             ORDER BY occurred_at_ms DESC, id DESC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![service, limit], circuit_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Returns all transitions within `[start, end)`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn circuit_transitions_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CircuitLogRecord>, AuditError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, service, previous_state, new_state, failure_count, detail, occurred_at_ms
             FROM circuit_log
             WHERE occurred_at_ms >= ?1 AND occurred_at_ms < ?2
             ORDER BY occurred_at_ms ASC, id ASC",
        )?;
        let rows = stmt
            .query_map(
                params![start.timestamp_millis(), end.timestamp_millis()],
                circuit_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn millis_to_utc(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn circuit_row(row: &rusqlite::Row<'_>) -> Result<CircuitLogRecord, rusqlite::Error> {
    let detail: String = row.get(5)?;
    Ok(CircuitLogRecord {
        id: Some(row.get::<_, i64>(0)? as u64),
        service: row.get(1)?,
        previous_state: row.get(2)?,
        new_state: row.get(3)?,
        failure_count: row.get::<_, i64>(4)? as u32,
        detail: serde_json::from_str(&detail).unwrap_or(serde_json::Value::Null),
        occurred_at: millis_to_utc(row.get::<_, i64>(6)?),
    })
}
