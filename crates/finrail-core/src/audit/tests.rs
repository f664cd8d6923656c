//! Tests for the audit log.

use chrono::{Duration as ChronoDuration, Utc};
use tempfile::TempDir;

use super::*;

fn temp_audit() -> (AuditLog, TempDir) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let audit = AuditLog::open(dir.path().join("audit.db")).expect("failed to open audit log");
    (audit, dir)
}

#[test]
fn lock_attempt_roundtrip() {
    let (audit, _dir) = temp_audit();

    let record = LockHistoryRecord::new("property:42:invest", "t-1", "instance-a", 5000, true);
    audit.record_lock_attempt(&record).unwrap();

    let history = audit.lock_history("property:42:invest", 10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].token, "t-1");
    assert_eq!(history[0].owner, "instance-a");
    assert_eq!(history[0].ttl_ms, 5000);
    assert!(history[0].acquired);
    assert!(history[0].released_at.is_none());
}

#[test]
fn failed_attempts_are_recorded_too() {
    let (audit, _dir) = temp_audit();

    audit
        .record_lock_attempt(&LockHistoryRecord::new("r", "t-1", "a", 1000, false))
        .unwrap();

    let history = audit.lock_history("r", 10).unwrap();
    assert_eq!(history.len(), 1);
    assert!(!history[0].acquired);
}

#[test]
fn mark_released_stamps_open_row_only() {
    let (audit, _dir) = temp_audit();

    audit
        .record_lock_attempt(&LockHistoryRecord::new("r", "t-1", "a", 1000, true))
        .unwrap();

    assert!(audit.mark_lock_released("r", "t-1", Utc::now()).unwrap());
    // Already stamped; no open row remains.
    assert!(!audit.mark_lock_released("r", "t-1", Utc::now()).unwrap());
    // Unknown token never matches.
    assert!(!audit.mark_lock_released("r", "t-2", Utc::now()).unwrap());

    let history = audit.lock_history("r", 10).unwrap();
    assert!(history[0].released_at.is_some());
}

#[test]
fn circuit_transitions_roundtrip() {
    let (audit, _dir) = temp_audit();

    let record = CircuitLogRecord::new(
        "finance.payments",
        "CLOSED",
        "OPEN",
        5,
        serde_json::json!({"last_error": "timeout"}),
    );
    audit.record_circuit_transition(&record).unwrap();

    let transitions = audit.circuit_transitions("finance.payments", 10).unwrap();
    assert_eq!(transitions.len(), 1);
    assert_eq!(transitions[0].previous_state, "CLOSED");
    assert_eq!(transitions[0].new_state, "OPEN");
    assert_eq!(transitions[0].failure_count, 5);
    assert_eq!(transitions[0].detail["last_error"], "timeout");
}

#[test]
fn transitions_between_filters_by_time() {
    let (audit, _dir) = temp_audit();

    let mut old = CircuitLogRecord::new("svc", "CLOSED", "OPEN", 5, serde_json::Value::Null);
    old.occurred_at = Utc::now() - ChronoDuration::hours(2);
    audit.record_circuit_transition(&old).unwrap();

    let recent = CircuitLogRecord::new("svc", "OPEN", "HALF_OPEN", 5, serde_json::Value::Null);
    audit.record_circuit_transition(&recent).unwrap();

    let window = audit
        .circuit_transitions_between(
            Utc::now() - ChronoDuration::hours(1),
            Utc::now() + ChronoDuration::seconds(1),
        )
        .unwrap();
    assert_eq!(window.len(), 1);
    assert_eq!(window[0].new_state, "HALF_OPEN");
}

#[test]
fn in_memory_audit_log_works() {
    let audit = AuditLog::in_memory().unwrap();
    audit
        .record_lock_attempt(&LockHistoryRecord::new("r", "t", "a", 100, true))
        .unwrap();
    assert_eq!(audit.lock_history("r", 10).unwrap().len(), 1);
}
