//! Tests for the notification fan-out.

use super::*;

#[tokio::test]
async fn broadcast_reaches_all_subscribers() {
    let notifier = BroadcastNotifier::new(16);
    let mut rx1 = notifier.subscribe();
    let mut rx2 = notifier.subscribe();

    notifier.notify(CoreNotification::LockAcquired {
        resource: "property:42:invest".to_string(),
        token: "t-1".to_string(),
        ttl_ms: 5000,
    });

    let n1 = rx1.recv().await.unwrap();
    let n2 = rx2.recv().await.unwrap();
    assert_eq!(n1, n2);
    assert!(matches!(
        n1,
        CoreNotification::LockAcquired { ref resource, .. } if resource == "property:42:invest"
    ));
}

#[tokio::test]
async fn notify_without_subscribers_is_silent() {
    let notifier = BroadcastNotifier::new(4);
    // Must not panic or error with zero receivers.
    notifier.notify(CoreNotification::LockReleased {
        resource: "r".to_string(),
        token: "t".to_string(),
    });
    assert_eq!(notifier.subscriber_count(), 0);
}

#[test]
fn notifications_serialize_with_kind_tag() {
    let n = CoreNotification::CircuitTransition {
        service: "finance.payments".to_string(),
        previous: "CLOSED".to_string(),
        current: "OPEN".to_string(),
        failure_count: 5,
    };
    let json = serde_json::to_value(&n).unwrap();
    assert_eq!(json["kind"], "circuit_transition");
    assert_eq!(json["service"], "finance.payments");
    assert_eq!(json["failure_count"], 5);
}
