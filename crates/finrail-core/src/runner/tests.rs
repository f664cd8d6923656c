//! Tests for the operation runner facade.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde_json::json;

use super::*;
use crate::audit::AuditLog;
use crate::breaker::{CircuitConfig, CircuitState};
use crate::events::EventDraft;
use crate::kv::MemoryKvStore;
use crate::lock::LockConfig;
use crate::notify::NullNotifier;

fn test_runner() -> OperationRunner {
    let audit = Arc::new(AuditLog::in_memory().unwrap());
    let notifier = Arc::new(NullNotifier);

    let locks = Arc::new(LockManager::new(
        Arc::new(MemoryKvStore::new()),
        Arc::clone(&audit),
        notifier.clone(),
        LockConfig {
            default_ttl: Duration::from_secs(5),
            max_retries: 1,
            retry_delay: Duration::from_millis(10),
            sweep_interval: Duration::from_secs(5),
            owner: "test-instance".to_string(),
        },
    ));
    let breakers = Arc::new(CircuitBreakerRegistry::new(
        CircuitConfig {
            failure_threshold: 3,
            reset_timeout: Duration::from_millis(100),
            half_open_success_threshold: 1,
            monitor_window: Duration::from_secs(60),
        },
        Arc::clone(&audit),
        notifier.clone(),
    ));
    let events = Arc::new(EventStore::in_memory(notifier).unwrap());

    OperationRunner::new(locks, breakers, events)
}

fn invest_request() -> OperationRequest {
    OperationRequest::new(
        "property:42:invest",
        "finance.investments",
        "investment",
        "inv-1",
    )
}

#[tokio::test]
async fn successful_run_appends_events_and_releases() {
    let runner = test_runner();

    let outcome = runner
        .run(invest_request().with_user("user-7"), || async {
            Ok::<_, io::Error>((
                42,
                vec![EventDraft::new(
                    "INVESTMENT_CREATED",
                    json!({"amount": 1000}),
                )],
            ))
        })
        .await
        .unwrap();

    assert_eq!(outcome.value, 42);
    assert_eq!(outcome.events.len(), 1);
    assert_eq!(outcome.events[0].version, 1);
    assert_eq!(outcome.events[0].user_id.as_deref(), Some("user-7"));

    // The event is durable and replayable.
    let state = runner.events().reconstruct("investment", "inv-1").unwrap();
    assert_eq!(state.field("amount"), Some(&json!(1000)));

    // The lock was released.
    let token = runner
        .locks()
        .acquire("property:42:invest", Duration::from_secs(1), 0, Duration::ZERO)
        .await
        .unwrap();
    assert!(token.is_some());
}

#[tokio::test]
async fn busy_resource_rejects_without_running_work() {
    let runner = test_runner();
    let calls = Arc::new(AtomicU32::new(0));

    let _token = runner
        .locks()
        .acquire("property:42:invest", Duration::from_secs(5), 0, Duration::ZERO)
        .await
        .unwrap()
        .unwrap();

    let calls_clone = Arc::clone(&calls);
    let err = runner
        .run(invest_request(), move || {
            let calls = calls_clone;
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, io::Error>(((), vec![]))
            }
        })
        .await
        .unwrap_err();

    assert!(matches!(err, OperationError::ResourceBusy { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn open_circuit_rejects_and_releases_the_lock() {
    let runner = test_runner();

    for _ in 0..3 {
        runner.breakers().record_failure("finance.investments", "boom");
    }
    assert_eq!(
        runner.breakers().state("finance.investments"),
        Some(CircuitState::Open)
    );

    let err = runner
        .run(invest_request(), || async {
            Ok::<_, io::Error>(((), vec![]))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, OperationError::CircuitOpen { .. }));

    // The lock taken in step one was released on the rejection path.
    let token = runner
        .locks()
        .acquire("property:42:invest", Duration::from_secs(1), 0, Duration::ZERO)
        .await
        .unwrap();
    assert!(token.is_some());
}

#[tokio::test]
async fn failing_work_records_breaker_failure_and_appends_nothing() {
    let runner = test_runner();

    let err = runner
        .run(invest_request(), || async {
            Err::<((), Vec<EventDraft>), _>(io::Error::other("charge failed"))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, OperationError::Work(_)));

    // No event was appended for the failed operation.
    let events = runner.events().get_events("investment", "inv-1").unwrap();
    assert!(events.is_empty());

    // Two more failures trip the circuit: the runner reported this one.
    runner.breakers().record_failure("finance.investments", "boom");
    runner.breakers().record_failure("finance.investments", "boom");
    assert_eq!(
        runner.breakers().state("finance.investments"),
        Some(CircuitState::Open)
    );

    // And the lock is free again.
    let token = runner
        .locks()
        .acquire("property:42:invest", Duration::from_secs(1), 0, Duration::ZERO)
        .await
        .unwrap();
    assert!(token.is_some());
}

#[tokio::test]
async fn fallback_covers_busy_and_open() {
    let runner = test_runner();

    let _token = runner
        .locks()
        .acquire("property:42:invest", Duration::from_secs(5), 0, Duration::ZERO)
        .await
        .unwrap()
        .unwrap();

    let outcome = runner
        .run_with_fallback(
            invest_request(),
            || async { Ok::<_, io::Error>((1, vec![])) },
            || -1,
        )
        .await
        .unwrap();
    assert_eq!(outcome.value, -1);
    assert!(outcome.events.is_empty());
}

#[tokio::test]
async fn work_error_still_propagates_through_fallback_variant() {
    let runner = test_runner();

    let err = runner
        .run_with_fallback(
            invest_request(),
            || async { Err::<((), Vec<EventDraft>), _>(io::Error::other("boom")) },
            || (),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, OperationError::Work(_)));
}

#[tokio::test]
async fn multiple_drafts_append_in_order() {
    let runner = test_runner();

    let outcome = runner
        .run(invest_request(), || async {
            Ok::<_, io::Error>((
                (),
                vec![
                    EventDraft::new("INVESTMENT_CREATED", json!({"amount": 500})),
                    EventDraft::new("FUNDS_WITHDRAWN", json!({"amount": 500})),
                ],
            ))
        })
        .await
        .unwrap();

    let versions: Vec<u64> = outcome.events.iter().map(|e| e.version).collect();
    assert_eq!(versions, vec![1, 2]);
}
