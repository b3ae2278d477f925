use std::sync::Arc;
use std::time::Duration;

use hermes::{Config, Error, KeepaliveConfig, PoolConfig};

use crate::{setup, setup_with};

#[tokio::test]
async fn cancel_terminates_a_running_query() {
    let (_server, manager, target) = setup().await;

    let conn = Arc::new(manager.acquire(&target).await.unwrap());
    conn.init(Duration::ZERO).await.unwrap();

    let running = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.exec_query("SELECT SLEEP(10)").await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    conn.cancel().await.unwrap();

    let err = running.await.unwrap().unwrap_err();
    match &err {
        Error::Server { code, .. } => assert_eq!(*code, 1317),
        other => panic!("expected interrupted error, got {other:?}"),
    }
    match conn.last_exception().await.unwrap() {
        Some(Error::Server { code: 1317, .. }) => {}
        other => panic!("expected recorded cancellation, got {other:?}"),
    }

    // Cancel does not close the session.
    let mut result = conn.exec_query("SELECT 1").await.unwrap();
    assert!(result.next_row().await.unwrap().is_some());

    conn.close().await;
    manager.shutdown().await;
}

#[tokio::test]
async fn idle_timeout_triggers_deferred_cancel() {
    let config = Config {
        pool: PoolConfig {
            network_timeout_ms: 200,
            ..Default::default()
        },
        keepalive: KeepaliveConfig {
            interval_ms: 60_000,
            timeout_ms: 5_000,
        },
    };
    let (server, manager, target) = setup_with(config).await;

    let conn = manager.acquire(&target).await.unwrap();
    conn.init(Duration::ZERO).await.unwrap();

    let err = conn.exec_query("SELECT SLEEP(10)").await.unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));

    // The driver pushed an out-of-band cancel; the server saw it and
    // error-terminated the request, so the session can be released cleanly.
    tokio::time::sleep(Duration::from_millis(100)).await;
    conn.close().await;

    let conn = manager.acquire(&target).await.unwrap();
    conn.init(Duration::ZERO).await.unwrap();
    let mut result = conn.exec_query("SELECT 1").await.unwrap();
    assert!(result.next_row().await.unwrap().is_some());
    conn.close().await;

    assert_eq!(
        server.state.sessions_opened.load(std::sync::atomic::Ordering::SeqCst),
        1
    );
    manager.shutdown().await;
}

#[tokio::test]
async fn kill_with_close_tears_down_the_handle() {
    let (_server, manager, target) = setup().await;

    let conn = manager.acquire(&target).await.unwrap();
    conn.init(Duration::ZERO).await.unwrap();

    conn.kill(true, true).await.unwrap();
    assert!(conn.is_closed().await);
    assert!(matches!(conn.exec_query("SELECT 1").await, Err(Error::Closed)));

    manager.shutdown().await;
}

#[tokio::test]
async fn concurrent_submitter_waits_for_previous_request() {
    let (_server, manager, target) = setup().await;

    let conn = Arc::new(manager.acquire(&target).await.unwrap());
    conn.init(Duration::ZERO).await.unwrap();

    let slow = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.exec_query("SELECT SLEEP(10)").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Second submitter blocks behind the in-flight request until cancel
    // produces its terminal frame.
    let fast = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.exec_query("SELECT 1").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!fast.is_finished());

    conn.cancel().await.unwrap();

    assert!(slow.await.unwrap().is_err());
    let mut result = fast.await.unwrap().unwrap();
    assert_eq!(
        result.next_row().await.unwrap(),
        Some(vec![hermes::Scalar::Int(1)])
    );

    conn.close().await;
    manager.shutdown().await;
}
