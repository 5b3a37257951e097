/// Session tests
///
/// One-transaction-at-a-time rule, closing, bookmark bookkeeping and
/// bookmark validation.
/// Run with: cargo test --test session_tests
mod common;

use causaldb::{
    AccessMode, Bookmark, DriverError, Fault, InMemoryCluster, SessionConfig, TransactionState,
};
use common::{DATABASE, cluster_driver, get, put, read_value};
use serde_json::json;
use tokio_test::{assert_err, assert_ok};

#[tokio::test]
async fn test_second_transaction_is_rejected_before_any_network_call() {
    let cluster = InMemoryCluster::new(DATABASE);
    let driver = cluster_driver(&cluster);
    let mut session = assert_ok!(driver.session(SessionConfig::default()));

    let tx = assert_ok!(session.begin_transaction(AccessMode::Write).await);
    assert_eq!(cluster.begin_count(&cluster.writer()), 1);

    let err = assert_err!(session.begin_transaction(AccessMode::Write).await);
    assert!(matches!(err, DriverError::SessionBusy));
    let err = assert_err!(session.run(get("a"), AccessMode::Read).await);
    assert!(matches!(err, DriverError::SessionBusy));
    let err = assert_err!(
        session
            .execute_write(|tx| async move { read_value(&tx, "a").await })
            .await
    );
    assert!(matches!(err, DriverError::SessionBusy));

    // Nothing reached the server
    assert_eq!(cluster.begin_count(&cluster.writer()), 1);

    assert_ok!(tx.commit().await);
    assert_ok!(session.begin_transaction(AccessMode::Write).await);
}

#[tokio::test]
async fn test_dropped_transaction_frees_the_session() {
    let cluster = InMemoryCluster::new(DATABASE);
    let driver = cluster_driver(&cluster);
    let mut session = assert_ok!(driver.session(SessionConfig::default()));

    {
        let tx = assert_ok!(session.begin_transaction(AccessMode::Write).await);
        assert_ok!(tx.run(put("a", 1)).await);
    }

    let next = assert_ok!(session.begin_transaction(AccessMode::Read).await);
    assert_eq!(driver.stats(&cluster.writer()).discarded, 1);
    assert_ok!(next.rollback().await);
    assert_eq!(cluster.read_committed("a"), None);
}

#[tokio::test]
async fn test_explicit_commit_updates_session_bookmark() {
    let cluster = InMemoryCluster::new(DATABASE);
    let driver = cluster_driver(&cluster);
    let mut session = assert_ok!(driver.session(SessionConfig::default()));
    assert!(session.last_bookmark().is_empty());

    let tx = assert_ok!(session.begin_transaction(AccessMode::Write).await);
    assert_ok!(tx.run(put("a", 1)).await);
    assert_ok!(tx.commit().await);

    let bookmark = session.last_bookmark();
    assert_eq!(Some(bookmark), tx.bookmark().await);
    assert_eq!(
        session.last_bookmark_tokens().into_iter().collect::<Vec<_>>(),
        vec![cluster.latest_token()]
    );
}

#[tokio::test]
async fn test_rollback_leaves_bookmark_untouched() {
    let cluster = InMemoryCluster::new(DATABASE);
    let driver = cluster_driver(&cluster);
    let start = Bookmark::new(DATABASE, [cluster.latest_token()]);
    let mut session = assert_ok!(driver.session(SessionConfig::new().with_bookmark(&start)));

    let tx = assert_ok!(session.begin_transaction(AccessMode::Write).await);
    assert_ok!(tx.run(put("a", 1)).await);
    assert_ok!(tx.rollback().await);

    assert_eq!(tx.state().await, TransactionState::RolledBack);
    assert_eq!(session.last_bookmark(), start);
    assert_eq!(cluster.read_committed("a"), None);
}

#[tokio::test]
async fn test_auto_commit_run_returns_records_and_advances_bookmark() {
    let cluster = InMemoryCluster::new(DATABASE);
    let driver = cluster_driver(&cluster);
    let mut session = assert_ok!(driver.session(SessionConfig::default()));

    assert_ok!(session.run(put("a", "apple"), AccessMode::Write).await);
    let first = session.last_bookmark();
    assert!(!first.is_empty());

    let result = assert_ok!(session.run(get("a"), AccessMode::Read).await);
    assert_eq!(result.row_count(), 1);
    assert_eq!(result.single().and_then(|r| r.get("value")), Some(&json!("apple")));
    assert_eq!(result.server(), &cluster.writer());
}

#[tokio::test]
async fn test_auto_commit_failure_is_not_retried() {
    let cluster = InMemoryCluster::new(DATABASE);
    let driver = cluster_driver(&cluster);
    let mut session = assert_ok!(driver.session(SessionConfig::default()));
    cluster.inject_fault(
        &cluster.writer(),
        Fault::Transient("TransientError.General.DatabaseUnavailable".into()),
    );

    let err = assert_err!(session.run(put("a", 1), AccessMode::Write).await);
    assert!(matches!(err, DriverError::Transient { .. }));
    assert_eq!(cluster.begin_count(&cluster.writer()), 1);
    assert!(session.last_bookmark().is_empty());
}

#[tokio::test]
async fn test_close_rolls_back_and_is_idempotent() {
    let cluster = InMemoryCluster::new(DATABASE);
    let driver = cluster_driver(&cluster);
    let mut session = assert_ok!(driver.session(SessionConfig::default()));

    let tx = assert_ok!(session.begin_transaction(AccessMode::Write).await);
    assert_ok!(tx.run(put("a", 1)).await);

    assert_ok!(session.close().await);
    assert!(session.is_closed());
    assert_eq!(tx.state().await, TransactionState::RolledBack);
    assert_eq!(cluster.read_committed("a"), None);

    let stats = driver.stats(&cluster.writer());
    assert_eq!(stats.in_use_connections, 0);
    assert_eq!(stats.idle_connections, 1);

    assert_ok!(session.close().await);
    let err = assert_err!(session.begin_transaction(AccessMode::Read).await);
    assert!(matches!(err, DriverError::SessionClosed));
    let err = assert_err!(session.run(get("a"), AccessMode::Read).await);
    assert!(matches!(err, DriverError::SessionClosed));
}

#[tokio::test]
async fn test_bookmark_for_another_database_is_rejected() {
    let cluster = InMemoryCluster::new(DATABASE);
    let driver = cluster_driver(&cluster);

    let foreign = Bookmark::new("bar", ["bar:1"]);
    let err = assert_err!(driver.session(SessionConfig::new().with_bookmark(&foreign)));
    assert!(matches!(err, DriverError::InvalidBookmark(_)));
    assert_eq!(err.kind(), causaldb::ErrorKind::Client);

    // Same bookmark is fine for a session on its own database
    let session = driver.session(SessionConfig::new().database("bar").with_bookmark(&foreign));
    assert_ok!(session);

    assert_eq!(cluster.begin_count(&cluster.writer()), 0);
}

#[tokio::test]
async fn test_raw_tokens_seed_the_session() {
    let cluster = InMemoryCluster::new(DATABASE);
    let driver = cluster_driver(&cluster);
    let mut writer = assert_ok!(driver.session(SessionConfig::default()));
    assert_ok!(writer.run(put("a", 1), AccessMode::Write).await);
    let tokens = writer.last_bookmark_tokens();

    let session = assert_ok!(driver.session(SessionConfig::new().with_bookmark_tokens(tokens.clone())));
    assert_eq!(session.last_bookmark_tokens(), tokens);
}

#[tokio::test]
async fn test_commit_connection_loss_leaves_transaction_failed() {
    let cluster = InMemoryCluster::new(DATABASE);
    let driver = cluster_driver(&cluster);
    let mut session = assert_ok!(driver.session(SessionConfig::default()));

    let tx = assert_ok!(session.begin_transaction(AccessMode::Write).await);
    assert_ok!(tx.run(put("a", 1)).await);
    cluster.inject_fault(&cluster.writer(), Fault::DropOnCommit);

    let err = assert_err!(tx.commit().await);
    assert!(matches!(err, DriverError::IndeterminateCommit(_)));
    assert_eq!(tx.state().await, TransactionState::Failed);
    assert!(session.last_bookmark().is_empty());
    assert_eq!(driver.stats(&cluster.writer()).discarded, 1);

    // A failed transaction no longer blocks the session
    assert_ok!(session.begin_transaction(AccessMode::Write).await);
}

#[tokio::test]
async fn test_default_access_mode_picks_the_server() {
    let cluster = InMemoryCluster::new(DATABASE).with_replicas(1);
    let replica = cluster.replicas()[0].clone();
    let driver = cluster_driver(&cluster);

    let mut writer = assert_ok!(driver.session(SessionConfig::default()));
    assert_eq!(writer.default_access_mode(), AccessMode::Write);
    let written = assert_ok!(writer.run_default(put("a", 1)).await);
    assert_eq!(written.server(), &cluster.writer());

    let mut reader = assert_ok!(driver.session(
        SessionConfig::new()
            .default_access_mode(AccessMode::Read)
            .with_bookmark(&writer.last_bookmark())
    ));
    let result = assert_ok!(reader.run_default(get("a")).await);
    assert_eq!(result.server(), &replica);
    assert_eq!(result.single().and_then(|r| r.get("value")), Some(&json!(1)));

    let tx = assert_ok!(reader.begin_default_transaction().await);
    assert_eq!(tx.access_mode().await, AccessMode::Read);
    assert_eq!(tx.server().await, replica);
    assert_ok!(tx.rollback().await);

    assert_eq!(cluster.begin_count(&replica), 2);
    assert_eq!(cluster.begin_count(&cluster.writer()), 1);
}

#[tokio::test]
async fn test_dropping_session_ends_its_open_transaction() {
    let cluster = InMemoryCluster::new(DATABASE);
    let driver = cluster_driver(&cluster);

    let tx = {
        let mut session = assert_ok!(driver.session(SessionConfig::default()));
        let tx = assert_ok!(session.begin_transaction(AccessMode::Write).await);
        assert_ok!(tx.run(put("a", 1)).await);
        tx
    };

    assert_eq!(tx.state().await, TransactionState::RolledBack);
    let err = assert_err!(tx.commit().await);
    assert!(matches!(err, DriverError::TransactionClosed { .. }));
    assert_eq!(cluster.read_committed("a"), None);

    let stats = driver.stats(&cluster.writer());
    assert_eq!(stats.in_use_connections, 0);
    assert_eq!(stats.discarded, 1);
}
