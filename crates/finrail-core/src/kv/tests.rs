//! Tests for the backing key-value store implementations.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use super::*;

#[tokio::test]
async fn memory_set_nx_is_exclusive() {
    let store = MemoryKvStore::new();

    assert!(
        store
            .set_nx_px("lock:a", "token-1", Duration::from_secs(5))
            .await
            .unwrap()
    );
    assert!(
        !store
            .set_nx_px("lock:a", "token-2", Duration::from_secs(5))
            .await
            .unwrap()
    );
    assert_eq!(
        store.get("lock:a").await.unwrap(),
        Some("token-1".to_string())
    );
}

#[tokio::test]
async fn memory_expired_key_can_be_reacquired() {
    let store = MemoryKvStore::new();

    assert!(
        store
            .set_nx_px("lock:a", "token-1", Duration::from_millis(30))
            .await
            .unwrap()
    );
    tokio::time::sleep(Duration::from_millis(60)).await;

    assert_eq!(store.get("lock:a").await.unwrap(), None);
    assert!(
        store
            .set_nx_px("lock:a", "token-2", Duration::from_secs(5))
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn memory_del_if_equal_is_token_scoped() {
    let store = MemoryKvStore::new();
    store
        .set_nx_px("lock:a", "token-1", Duration::from_secs(5))
        .await
        .unwrap();

    assert!(!store.del_if_equal("lock:a", "token-2").await.unwrap());
    assert_eq!(
        store.get("lock:a").await.unwrap(),
        Some("token-1".to_string())
    );

    assert!(store.del_if_equal("lock:a", "token-1").await.unwrap());
    assert_eq!(store.get("lock:a").await.unwrap(), None);
    assert!(store.is_empty());
}

#[tokio::test]
async fn memory_pexpire_if_equal_extends_only_for_holder() {
    let store = MemoryKvStore::new();
    store
        .set_nx_px("lock:a", "token-1", Duration::from_millis(50))
        .await
        .unwrap();

    assert!(
        !store
            .pexpire_if_equal("lock:a", "token-2", Duration::from_secs(5))
            .await
            .unwrap()
    );
    assert!(
        store
            .pexpire_if_equal("lock:a", "token-1", Duration::from_secs(5))
            .await
            .unwrap()
    );

    tokio::time::sleep(Duration::from_millis(80)).await;
    // Still held thanks to the extension.
    assert_eq!(
        store.get("lock:a").await.unwrap(),
        Some("token-1".to_string())
    );
}

#[tokio::test]
async fn memory_extend_after_expiry_fails() {
    let store = MemoryKvStore::new();
    store
        .set_nx_px("lock:a", "token-1", Duration::from_millis(20))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(
        !store
            .pexpire_if_equal("lock:a", "token-1", Duration::from_secs(5))
            .await
            .unwrap()
    );
}

/// Starts a one-connection RESP server that sends `replies` in order,
/// ignoring request contents. Returns the address to dial.
async fn scripted_resp_server(replies: Vec<&'static [u8]>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4096];
        for reply in replies {
            // Wait for a command to arrive before answering.
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                return;
            }
            socket.write_all(reply).await.unwrap();
        }
    });

    addr
}

#[tokio::test]
async fn resp_set_nx_parses_ok_and_null() {
    let addr = scripted_resp_server(vec![b"+OK\r\n", b"$-1\r\n"]).await;
    let store = RespKvStore::new(addr);

    assert!(
        store
            .set_nx_px("lock:a", "token-1", Duration::from_secs(1))
            .await
            .unwrap()
    );
    assert!(
        !store
            .set_nx_px("lock:a", "token-2", Duration::from_secs(1))
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn resp_get_parses_bulk_and_null() {
    let addr = scripted_resp_server(vec![b"$7\r\ntoken-1\r\n", b"$-1\r\n"]).await;
    let store = RespKvStore::new(addr);

    assert_eq!(
        store.get("lock:a").await.unwrap(),
        Some("token-1".to_string())
    );
    assert_eq!(store.get("lock:b").await.unwrap(), None);
}

#[tokio::test]
async fn resp_eval_replies_drive_cas_results() {
    let addr = scripted_resp_server(vec![b":1\r\n", b":0\r\n", b":1\r\n"]).await;
    let store = RespKvStore::new(addr);

    assert!(store.del_if_equal("lock:a", "token-1").await.unwrap());
    assert!(!store.del_if_equal("lock:a", "token-2").await.unwrap());
    assert!(
        store
            .pexpire_if_equal("lock:a", "token-1", Duration::from_secs(1))
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn resp_server_error_is_surfaced() {
    let addr = scripted_resp_server(vec![b"-ERR unknown command\r\n"]).await;
    let store = RespKvStore::new(addr);

    let err = store.get("lock:a").await.unwrap_err();
    assert!(matches!(err, KvError::Server(msg) if msg.contains("unknown command")));
}

#[tokio::test]
async fn trait_object_usable_across_tasks() {
    let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store
                .set_nx_px("lock:shared", &format!("token-{i}"), Duration::from_secs(5))
                .await
                .unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1, "exactly one concurrent set_nx may win");
}
