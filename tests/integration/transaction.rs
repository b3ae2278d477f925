use std::collections::HashMap;
use std::time::Duration;

use hermes::{IsolationLevel, QuerySpec};

use crate::setup;

#[tokio::test]
async fn explicit_transaction_commit() {
    let (server, manager, target) = setup().await;

    let conn = manager.acquire(&target).await.unwrap();
    conn.init(Duration::ZERO).await.unwrap();

    conn.set_auto_commit(false).await.unwrap();
    assert!(!conn.auto_commit());

    let affected = conn.exec_update("INSERT INTO t VALUES (1)").await.unwrap();
    assert_eq!(affected, 1);
    assert!(!conn.auto_commit());

    conn.commit().await.unwrap();
    conn.close().await;

    // The transaction was committed; close must not issue a rollback.
    assert!(!server.state.logged_sql().iter().any(|s| s == "rollback"));
    manager.shutdown().await;
}

#[tokio::test]
async fn uncommitted_transaction_rolls_back_on_close() {
    let (server, manager, target) = setup().await;

    let conn = manager.acquire(&target).await.unwrap();
    conn.init(Duration::ZERO).await.unwrap();

    conn.set_auto_commit(false).await.unwrap();
    conn.exec_update("INSERT INTO t VALUES (1)").await.unwrap();
    conn.close().await;

    assert!(server.state.logged_sql().iter().any(|s| s == "rollback"));
    manager.shutdown().await;
}

#[tokio::test]
async fn redundant_auto_commit_sends_one_statement() {
    let (server, manager, target) = setup().await;

    let conn = manager.acquire(&target).await.unwrap();
    conn.init(Duration::ZERO).await.unwrap();

    conn.set_auto_commit(false).await.unwrap();
    conn.set_auto_commit(false).await.unwrap();
    conn.set_auto_commit(false).await.unwrap();

    let sets = server
        .state
        .logged_sql()
        .iter()
        .filter(|s| s.starts_with("SET autocommit=0"))
        .count();
    assert_eq!(sets, 1);

    conn.close().await;
    manager.shutdown().await;
}

#[tokio::test]
async fn lazy_cts_piggybacks_on_first_statement() {
    let (server, manager, target) = setup().await;

    let conn = manager.acquire(&target).await.unwrap();
    conn.init(Duration::ZERO).await.unwrap();

    conn.set_auto_commit(false).await.unwrap();
    conn.set_lazy_cts_transaction().await.unwrap();
    conn.set_lazy_snapshot_seq(100).await.unwrap();

    let mut result = conn.exec_query("SELECT * FROM t").await.unwrap();
    while result.next_row().await.unwrap().is_some() {}

    // Exactly one outbound exec carries the transaction envelope, and no
    // separate begin statement was sent.
    let log = server.state.exec_log.lock().clone();
    let carrying: Vec<_> = log.iter().filter(|e| e.txn.is_some()).collect();
    assert_eq!(carrying.len(), 1);
    assert_eq!(carrying[0].sql, "SELECT * FROM t");
    let envelope = carrying[0].txn.clone().unwrap();
    assert!(envelope.cts);
    assert_eq!(envelope.snapshot_seq, Some(100));
    assert!(!log.iter().any(|e| e.sql.eq_ignore_ascii_case("begin")));

    // The envelope was consumed; the next statement carries none.
    conn.exec_query("SELECT 1").await.unwrap();
    let log = server.state.exec_log.lock().clone();
    let select_one = log.iter().find(|e| e.sql == "SELECT 1").unwrap();
    assert!(select_one.txn.is_none());

    conn.rollback().await.unwrap();
    conn.close().await;
    manager.shutdown().await;
}

#[tokio::test]
async fn lazy_commit_seq_rides_on_commit() {
    let (server, manager, target) = setup().await;

    let conn = manager.acquire(&target).await.unwrap();
    conn.init(Duration::ZERO).await.unwrap();

    conn.set_auto_commit(false).await.unwrap();
    conn.exec_update("INSERT INTO t VALUES (1)").await.unwrap();
    conn.set_lazy_commit_seq(777).await.unwrap();
    conn.commit().await.unwrap();

    let logged = server.state.find_exec("commit").unwrap();
    assert_eq!(logged.txn.unwrap().commit_seq, Some(777));

    conn.close().await;
    manager.shutdown().await;
}

#[tokio::test]
async fn isolation_level_is_cached() {
    let (server, manager, target) = setup().await;

    let conn = manager.acquire(&target).await.unwrap();
    conn.init(Duration::ZERO).await.unwrap();

    conn.set_transaction_isolation(IsolationLevel::RepeatableRead)
        .await
        .unwrap();
    conn.set_transaction_isolation(IsolationLevel::RepeatableRead)
        .await
        .unwrap();
    assert_eq!(
        conn.transaction_isolation().await.unwrap(),
        Some(IsolationLevel::RepeatableRead)
    );

    conn.exec_query("SELECT 1").await.unwrap();
    let sets = server
        .state
        .logged_sql()
        .iter()
        .filter(|s| s.contains("isolation level repeatable read"))
        .count();
    assert_eq!(sets, 1);

    conn.set_transaction_isolation(IsolationLevel::Serializable)
        .await
        .unwrap();
    assert_eq!(
        conn.transaction_isolation().await.unwrap(),
        Some(IsolationLevel::Serializable)
    );

    conn.close().await;
    manager.shutdown().await;
}

#[tokio::test]
async fn isolation_change_preserves_lazy_envelope() {
    let (server, manager, target) = setup().await;

    let conn = manager.acquire(&target).await.unwrap();
    conn.init(Duration::ZERO).await.unwrap();

    conn.set_auto_commit(false).await.unwrap();
    conn.set_lazy_snapshot_seq(5).await.unwrap();
    conn.set_transaction_isolation(IsolationLevel::Serializable)
        .await
        .unwrap();

    let mut result = conn.exec_query("SELECT * FROM t").await.unwrap();
    while result.next_row().await.unwrap().is_some() {}

    let log = server.state.exec_log.lock().clone();
    let isolation = log
        .iter()
        .find(|e| e.sql.contains("isolation level serializable"))
        .unwrap();
    assert!(isolation.txn.is_none(), "isolation SQL consumed the envelope");
    let select = log.iter().find(|e| e.sql == "SELECT * FROM t").unwrap();
    assert_eq!(select.txn.clone().unwrap().snapshot_seq, Some(5));

    conn.rollback().await.unwrap();
    conn.close().await;
    manager.shutdown().await;
}

#[tokio::test]
async fn session_variables_flush_once() {
    let (server, manager, target) = setup().await;

    let conn = manager.acquire(&target).await.unwrap();
    conn.init(Duration::ZERO).await.unwrap();

    let mut vars = HashMap::new();
    vars.insert("sql_mode".to_string(), "'STRICT_ALL_TABLES'".to_string());
    assert_eq!(conn.set_session_variables(&vars).await.unwrap(), 1);
    // Same values again: tracked, nothing queued.
    assert_eq!(conn.set_session_variables(&vars).await.unwrap(), 0);

    conn.exec_query("SELECT 1").await.unwrap();

    let sql = server.state.logged_sql();
    let set = sql
        .iter()
        .position(|s| s.contains("`sql_mode`='STRICT_ALL_TABLES'"))
        .expect("variable assignment reached the server");
    let select = sql.iter().position(|s| s == "SELECT 1").unwrap();
    assert!(set < select, "assignment must precede the query");
    assert_eq!(
        sql.iter()
            .filter(|s| s.contains("`sql_mode`"))
            .count(),
        1
    );

    conn.close().await;
    manager.shutdown().await;
}

#[tokio::test]
async fn explicit_query_spec_shapes() {
    let (server, manager, target) = setup().await;

    let conn = manager.acquire(&target).await.unwrap();
    conn.init(Duration::ZERO).await.unwrap();

    let spec = QuerySpec::sql("SELECT 1")
        .with_hint(&b"/*+ force */"[..])
        .with_digest(&b"\x10\x20"[..])
        .with_args(vec![hermes::Scalar::Int(5)]);
    conn.exec_query_spec(spec, false).await.unwrap();
    assert!(server.state.find_exec("SELECT 1").is_some());

    conn.close().await;
    manager.shutdown().await;
}
