//! Tests for the event store and reducer.

use std::sync::Arc;
use std::thread;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use tempfile::TempDir;

use super::*;
use crate::notify::NullNotifier;

fn temp_store() -> (EventStore, TempDir) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let store = EventStore::open(dir.path().join("events.db"), Arc::new(NullNotifier))
        .expect("failed to open event store");
    (store, dir)
}

#[test]
fn append_assigns_versions_from_one() {
    let (store, _dir) = temp_store();

    let first = store
        .append(
            "investment",
            "inv-1",
            EventDraft::new("INVESTMENT_CREATED", json!({"amount": 1000})),
        )
        .unwrap();
    let second = store
        .append(
            "investment",
            "inv-1",
            EventDraft::new("INVESTMENT_MATURED", json!({"actualROI": 12.5})),
        )
        .unwrap();

    assert_eq!(first.version, 1);
    assert_eq!(second.version, 2);
    assert_eq!(first.event_type, EventType::InvestmentCreated);
}

#[test]
fn versions_are_scoped_per_aggregate() {
    let (store, _dir) = temp_store();

    store
        .append("investment", "inv-1", EventDraft::new("INVESTMENT_CREATED", json!({})))
        .unwrap();
    let other = store
        .append("investment", "inv-2", EventDraft::new("INVESTMENT_CREATED", json!({})))
        .unwrap();
    let wallet = store
        .append("wallet", "inv-1", EventDraft::new("FUNDS_DEPOSITED", json!({"amount": 5})))
        .unwrap();

    // Different aggregate id and different aggregate type both start fresh.
    assert_eq!(other.version, 1);
    assert_eq!(wallet.version, 1);
}

#[test]
fn get_events_returns_ascending_versions() {
    let (store, _dir) = temp_store();

    for i in 0..5 {
        store
            .append(
                "investment",
                "inv-1",
                EventDraft::new("ROI_DISTRIBUTED", json!({"round": i})),
            )
            .unwrap();
    }

    let events = store.get_events("investment", "inv-1").unwrap();
    let versions: Vec<u64> = events.iter().map(|e| e.version).collect();
    assert_eq!(versions, vec![1, 2, 3, 4, 5]);
}

#[test]
fn gapless_versions_under_concurrent_appenders() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("events.db");
    // Create the schema before spawning writers.
    let _ = EventStore::open(&path, Arc::new(NullNotifier)).unwrap();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let path = path.clone();
        handles.push(thread::spawn(move || {
            let store = EventStore::open(&path, Arc::new(NullNotifier)).unwrap();
            for _ in 0..5 {
                store
                    .append(
                        "investment",
                        "inv-contended",
                        EventDraft::new("ROI_DISTRIBUTED", json!({})),
                    )
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().expect("appender thread panicked");
    }

    let store = EventStore::open(&path, Arc::new(NullNotifier)).unwrap();
    let events = store.get_events("investment", "inv-contended").unwrap();
    let versions: Vec<u64> = events.iter().map(|e| e.version).collect();
    assert_eq!(versions, (1..=20).collect::<Vec<u64>>());
}

#[test]
fn query_by_type_filters_on_time_window() {
    let (store, _dir) = temp_store();

    store
        .append("investment", "inv-1", EventDraft::new("INVESTMENT_CREATED", json!({})))
        .unwrap();
    store
        .append("investment", "inv-2", EventDraft::new("INVESTMENT_MATURED", json!({})))
        .unwrap();

    let start = Utc::now() - ChronoDuration::minutes(1);
    let end = Utc::now() + ChronoDuration::minutes(1);

    let created = store.query_by_type("INVESTMENT_CREATED", start, end).unwrap();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].aggregate_id, "inv-1");

    // Nothing recorded before the window started.
    let earlier = store
        .query_by_type("INVESTMENT_CREATED", start - ChronoDuration::hours(1), start)
        .unwrap();
    assert!(earlier.is_empty());
}

#[test]
fn reconstruct_folds_created_then_matured() {
    let (store, _dir) = temp_store();

    store
        .append(
            "investment",
            "inv-x",
            EventDraft::new("INVESTMENT_CREATED", json!({"amount": 1000})).with_user("user-7"),
        )
        .unwrap();
    store
        .append(
            "investment",
            "inv-x",
            EventDraft::new("INVESTMENT_MATURED", json!({"actualROI": 12.5})),
        )
        .unwrap();

    let state = store.reconstruct("investment", "inv-x").unwrap();
    assert_eq!(state.version, 2);
    assert_eq!(state.status.as_deref(), Some("matured"));
    assert_eq!(state.field("amount"), Some(&json!(1000)));
    assert_eq!(state.field("actualROI"), Some(&json!(12.5)));
}

#[test]
fn reconstruct_of_empty_stream_is_empty_state() {
    let (store, _dir) = temp_store();

    let state = store.reconstruct("investment", "missing").unwrap();
    assert_eq!(state.version, 0);
    assert!(state.status.is_none());
    assert!(state.data.is_empty());
}

#[test]
fn replay_is_deterministic() {
    let (store, _dir) = temp_store();

    store
        .append(
            "wallet",
            "w-1",
            EventDraft::new("FUNDS_DEPOSITED", json!({"amount": 250.0})),
        )
        .unwrap();
    store
        .append(
            "wallet",
            "w-1",
            EventDraft::new("FUNDS_WITHDRAWN", json!({"amount": 100.0})),
        )
        .unwrap();

    let first = store.reconstruct("wallet", "w-1").unwrap();
    let second = store.reconstruct("wallet", "w-1").unwrap();
    assert_eq!(first, second);
    assert_eq!(first.field("balance"), Some(&json!(150.0)));
}

#[test]
fn unknown_event_types_pass_through_replay() {
    let (store, _dir) = temp_store();

    store
        .append(
            "investment",
            "inv-1",
            EventDraft::new("INVESTMENT_CREATED", json!({"amount": 10})),
        )
        .unwrap();
    store
        .append(
            "investment",
            "inv-1",
            EventDraft::new("SOME_FUTURE_EVENT", json!({"ignored": true})),
        )
        .unwrap();

    let state = store.reconstruct("investment", "inv-1").unwrap();
    // The unknown event advanced the version but changed nothing else.
    assert_eq!(state.version, 2);
    assert_eq!(state.status.as_deref(), Some("active"));
    assert_eq!(state.field("ignored"), None);
}

#[test]
fn cancellation_is_a_compensating_event() {
    let (store, _dir) = temp_store();

    store
        .append(
            "investment",
            "inv-1",
            EventDraft::new("INVESTMENT_CREATED", json!({"amount": 10})),
        )
        .unwrap();
    store
        .append(
            "investment",
            "inv-1",
            EventDraft::new("INVESTMENT_CANCELLED", json!({"reason": "user request"})),
        )
        .unwrap();

    let events = store.get_events("investment", "inv-1").unwrap();
    assert_eq!(events.len(), 2, "history keeps both events");

    let state = store.reconstruct("investment", "inv-1").unwrap();
    assert_eq!(state.status.as_deref(), Some("cancelled"));
}

#[test]
fn stats_counts_events_and_aggregates() {
    let (store, _dir) = temp_store();

    store
        .append("investment", "inv-1", EventDraft::new("INVESTMENT_CREATED", json!({})))
        .unwrap();
    store
        .append("investment", "inv-1", EventDraft::new("INVESTMENT_MATURED", json!({})))
        .unwrap();
    store
        .append("wallet", "w-1", EventDraft::new("FUNDS_DEPOSITED", json!({"amount": 1})))
        .unwrap();

    let stats = store.stats().unwrap();
    assert_eq!(stats.event_count, 3);
    assert_eq!(stats.aggregate_count, 2);
}

#[test]
fn event_type_string_roundtrip() {
    for (variant, s) in [
        (EventType::InvestmentCreated, "INVESTMENT_CREATED"),
        (EventType::RoiDistributed, "ROI_DISTRIBUTED"),
        (EventType::SecondarySaleCompleted, "SECONDARY_SALE_COMPLETED"),
    ] {
        assert_eq!(variant.as_str(), s);
        assert_eq!(EventType::from(s), variant);
    }
    assert_eq!(
        EventType::from("SOMETHING_ELSE"),
        EventType::Other("SOMETHING_ELSE".to_string())
    );
}

#[test]
fn in_memory_store_works() {
    let store = EventStore::in_memory(Arc::new(NullNotifier)).unwrap();
    let event = store
        .append("investment", "inv-1", EventDraft::new("INVESTMENT_CREATED", json!({})))
        .unwrap();
    assert_eq!(event.version, 1);
}
