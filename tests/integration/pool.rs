use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use hermes::{Config, Error, KeepaliveConfig, PoolConfig};

use crate::{setup, setup_with};

fn tight_pool(acquire_timeout_ms: u64) -> Config {
    Config {
        pool: PoolConfig {
            max_transports_per_target: 1,
            max_sessions_per_transport: 1,
            acquire_timeout_ms,
            network_timeout_ms: 2_000,
            ..Default::default()
        },
        keepalive: KeepaliveConfig {
            interval_ms: 60_000,
            timeout_ms: 5_000,
        },
    }
}

#[tokio::test]
async fn saturated_pool_times_out_then_reuses() {
    let (server, manager, target) = setup_with(tight_pool(50)).await;

    let first = manager.acquire(&target).await.unwrap();
    first.init(Duration::ZERO).await.unwrap();

    let started = Instant::now();
    let second = manager.acquire(&target).await;
    let waited = started.elapsed();
    assert!(matches!(second, Err(Error::AcquireTimeout(_))));
    assert!(waited >= Duration::from_millis(50));

    first.close().await;

    let third = manager.acquire(&target).await.unwrap();
    third.init(Duration::ZERO).await.unwrap();
    let mut result = third.exec_query("SELECT 1").await.unwrap();
    assert!(result.next_row().await.unwrap().is_some());
    third.close().await;

    // The reused session never re-opened on the wire.
    assert_eq!(server.state.sessions_opened.load(Ordering::SeqCst), 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn zero_acquire_timeout_fails_immediately() {
    let (_server, manager, target) = setup_with(tight_pool(0)).await;

    let first = manager.acquire(&target).await.unwrap();

    let started = Instant::now();
    let second = manager.acquire(&target).await;
    assert!(matches!(second, Err(Error::AcquireTimeout(_))));
    assert!(started.elapsed() < Duration::from_millis(50));

    first.close().await;
    manager.shutdown().await;
}

#[tokio::test]
async fn sessions_multiplex_on_one_transport() {
    let config = Config {
        pool: PoolConfig {
            max_transports_per_target: 1,
            max_sessions_per_transport: 4,
            network_timeout_ms: 2_000,
            ..Default::default()
        },
        ..Default::default()
    };
    let (server, manager, target) = setup_with(config).await;

    let a = manager.acquire(&target).await.unwrap();
    let b = manager.acquire(&target).await.unwrap();
    let c = manager.acquire(&target).await.unwrap();
    a.init(Duration::ZERO).await.unwrap();
    b.init(Duration::ZERO).await.unwrap();
    c.init(Duration::ZERO).await.unwrap();

    // Distinct sessions, one socket.
    let ids = [
        a.connection_id().await.unwrap(),
        b.connection_id().await.unwrap(),
        c.connection_id().await.unwrap(),
    ];
    assert!(ids[0] != ids[1] && ids[1] != ids[2]);
    assert_eq!(server.state.sessions_opened.load(Ordering::SeqCst), 3);

    let pool = manager.target_pool(&target).await;
    assert_eq!(pool.transport_count().await, 1);
    assert_eq!(pool.session_count().await, 3);

    for conn in [a, b, c] {
        let mut result = conn.exec_query("SELECT 1").await.unwrap();
        assert!(result.next_row().await.unwrap().is_some());
        conn.close().await;
    }
    manager.shutdown().await;
}

#[tokio::test]
async fn transport_failure_fails_sessions_and_recovers() {
    let (server, manager, target) = setup().await;

    let conn = manager.acquire(&target).await.unwrap();
    conn.init(Duration::ZERO).await.unwrap();

    let err = conn.exec_query("SELECT DIE").await.unwrap_err();
    assert!(matches!(err, Error::Transport(_)));

    // Anything else on the dead session fails too.
    assert!(conn.exec_query("SELECT 1").await.is_err());
    conn.close().await;

    // A fresh acquire builds a new transport and works.
    let conn = manager.acquire(&target).await.unwrap();
    conn.init(Duration::ZERO).await.unwrap();
    let mut result = conn.exec_query("SELECT 1").await.unwrap();
    assert!(result.next_row().await.unwrap().is_some());
    conn.close().await;

    assert_eq!(server.state.sessions_opened.load(Ordering::SeqCst), 2);
    manager.shutdown().await;
}

#[tokio::test]
async fn killed_session_is_not_reused() {
    let (server, manager, target) = setup().await;

    let conn = manager.acquire(&target).await.unwrap();
    conn.init(Duration::ZERO).await.unwrap();

    conn.kill(true, false).await.unwrap();
    assert!(!conn.is_closed().await);
    assert!(matches!(
        conn.exec_query("SELECT 1").await,
        Err(Error::SessionKilled)
    ));

    conn.close().await;

    let conn = manager.acquire(&target).await.unwrap();
    conn.init(Duration::ZERO).await.unwrap();
    conn.close().await;

    // The killed session was dropped, so a second open happened.
    assert_eq!(server.state.sessions_opened.load(Ordering::SeqCst), 2);
    manager.shutdown().await;
}

#[tokio::test]
async fn idle_sessions_are_reaped() {
    let config = Config {
        pool: PoolConfig {
            idle_session_ttl_ms: 200,
            network_timeout_ms: 2_000,
            ..Default::default()
        },
        ..Default::default()
    };
    let (server, manager, target) = setup_with(config).await;

    let conn = manager.acquire(&target).await.unwrap();
    conn.init(Duration::ZERO).await.unwrap();
    conn.close().await;

    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(server.state.sessions_closed.load(Ordering::SeqCst), 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn leak_check_tolerates_open_transactions() {
    let config = Config {
        pool: PoolConfig {
            enable_trx_leak_check: true,
            network_timeout_ms: 2_000,
            ..Default::default()
        },
        ..Default::default()
    };
    let (server, manager, target) = setup_with(config).await;

    let conn = manager.acquire(&target).await.unwrap();
    conn.init(Duration::ZERO).await.unwrap();
    conn.set_auto_commit(false).await.unwrap();
    conn.exec_update("INSERT INTO t VALUES (1)").await.unwrap();

    // Leaked transaction: close warns with the acquire-site stack, rolls the
    // transaction back and still recycles the session.
    conn.close().await;
    assert!(server.state.logged_sql().iter().any(|s| s == "rollback"));

    let conn = manager.acquire(&target).await.unwrap();
    conn.init(Duration::ZERO).await.unwrap();
    conn.close().await;
    assert_eq!(server.state.sessions_opened.load(Ordering::SeqCst), 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn wait_time_is_stamped_on_the_handle() {
    let (_server, manager, target) = setup_with(tight_pool(500)).await;

    let first = manager.acquire(&target).await.unwrap();
    first.init(Duration::ZERO).await.unwrap();
    assert!(first.connect_nanos() > 0);

    // A blocked acquire that eventually succeeds records its wait.
    let manager2 = manager.clone();
    let target2 = target.clone();
    let waiter = tokio::spawn(async move { manager2.acquire(&target2).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    first.close().await;

    let second = waiter.await.unwrap().unwrap();
    assert!(second.wait_nanos() >= Duration::from_millis(100).as_nanos() as u64);
    second.close().await;
    manager.shutdown().await;
}
