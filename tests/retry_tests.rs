/// Transaction function retry tests
///
/// Retry classification, the retry budget, backoff and router feedback.
/// Run with: cargo test --test retry_tests
mod common;

use async_trait::async_trait;
use causaldb::{
    AccessMode, DriverError, ErrorKind, Fault, InMemoryCluster, Result, RetryPolicy, Router,
    RoutingTable, ServerAddress, SessionConfig, StaticRouter,
};
use common::{DATABASE, cluster_driver, driver_with, put, read_value, transient};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio_test::{assert_err, assert_ok};

/// Counts routing requests and failure reports on top of a [`StaticRouter`].
struct CountingRouter {
    inner: StaticRouter,
    routes: AtomicUsize,
    failures: AtomicUsize,
}

impl CountingRouter {
    fn new(inner: StaticRouter) -> Self {
        Self {
            inner,
            routes: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Router for CountingRouter {
    async fn route(&self, mode: AccessMode, database: &str) -> Result<ServerAddress> {
        self.routes.fetch_add(1, Ordering::SeqCst);
        self.inner.route(mode, database).await
    }

    async fn on_failure(&self, address: &ServerAddress, database: &str, error: &DriverError) {
        self.failures.fetch_add(1, Ordering::SeqCst);
        self.inner.on_failure(address, database, error).await;
    }
}

#[tokio::test]
async fn test_third_attempt_succeeds_after_two_transient_failures() {
    let cluster = InMemoryCluster::new(DATABASE);
    let writer = cluster.writer();
    let router = Arc::new(CountingRouter::new(StaticRouter::direct(writer.clone())));
    let driver = driver_with(
        &cluster,
        router.clone(),
        RetryPolicy::immediate(Duration::from_secs(2)),
    );
    for _ in 0..2 {
        cluster.inject_fault(
            &writer,
            Fault::Transient("TransientError.Transaction.DeadlockDetected".into()),
        );
    }

    let mut session = assert_ok!(driver.session(SessionConfig::default()));
    let calls = AtomicUsize::new(0);
    let value = assert_ok!(
        session
            .execute_write(|tx| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    tx.run(put("q1", "done")).await?;
                    Ok::<_, DriverError>("committed")
                }
            })
            .await
    );

    assert_eq!(value, "committed");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(router.routes.load(Ordering::SeqCst), 3);
    let stats = driver.stats(&writer);
    assert_eq!(stats.acquisitions, 3);
    // Each failed attempt's connection is thrown away
    assert_eq!(stats.discarded, 2);
    assert_eq!(stats.created, 3);
    assert_eq!(cluster.read_committed("q1"), Some(json!("done")));
    // Transient server errors say nothing about the server's health
    assert_eq!(router.failures.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_always_transient_work_exhausts_retry_budget() {
    let cluster = InMemoryCluster::new(DATABASE);
    let policy = RetryPolicy {
        max_retry_time: Duration::from_millis(300),
        max_attempts: None,
        initial_delay: Duration::from_millis(10),
        multiplier: 2.0,
        jitter_factor: 0.2,
        max_delay: Duration::from_millis(50),
        attempt_timeout: None,
    };
    let driver = driver_with(
        &cluster,
        Arc::new(StaticRouter::direct(cluster.writer())),
        policy,
    );
    let mut session = assert_ok!(driver.session(SessionConfig::default()));

    let started = Instant::now();
    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        session.execute_write(|_tx| async { Err::<(), _>(transient()) }),
    )
    .await
    .expect("runner must give up on its own");
    let elapsed = started.elapsed();

    let err = assert_err!(outcome);
    assert_eq!(err.kind(), ErrorKind::RetriesExhausted);
    match &err {
        DriverError::RetriesExhausted {
            attempts, causes, ..
        } => {
            assert!(*attempts >= 2, "only {attempts} attempt(s)");
            assert_eq!(causes.len(), *attempts);
            assert!(causes.iter().all(|cause| cause.kind() == ErrorKind::Transient));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().contains("deadlock"));
    assert!(elapsed >= Duration::from_millis(300));
    assert!(elapsed < Duration::from_secs(2));
    assert!(session.last_bookmark().is_empty());
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let cluster = InMemoryCluster::new(DATABASE);
    let driver = cluster_driver(&cluster);
    let mut session = assert_ok!(driver.session(SessionConfig::default()));
    let calls = AtomicUsize::new(0);

    let err = assert_err!(
        session
            .execute_write(|tx| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { tx.run("DROP EVERYTHING").await }
            })
            .await
    );

    assert_eq!(err.kind(), ErrorKind::Client);
    assert_eq!(err.code(), Some("ClientError.Statement.SyntaxError"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_database_errors_are_not_retried() {
    let cluster = InMemoryCluster::new(DATABASE);
    let driver = cluster_driver(&cluster);
    cluster.inject_fault(
        &cluster.writer(),
        Fault::Database("DatabaseError.General.UnknownError".into()),
    );
    let mut session = assert_ok!(driver.session(SessionConfig::default()));

    let err = assert_err!(
        session
            .execute_write(|tx| async move { tx.run(put("a", 1)).await })
            .await
    );
    assert_eq!(err.kind(), ErrorKind::Database);
    assert_eq!(cluster.read_committed("a"), None);
}

#[tokio::test]
async fn test_application_errors_propagate_unmodified() {
    let cluster = InMemoryCluster::new(DATABASE);
    let driver = cluster_driver(&cluster);
    let mut session = assert_ok!(driver.session(SessionConfig::default()));

    let err = assert_err!(
        session
            .execute_write(|tx| async move {
                tx.run(put("a", 1)).await?;
                Err::<(), _>(DriverError::application(anyhow::anyhow!("insufficient funds")))
            })
            .await
    );

    assert_eq!(err.kind(), ErrorKind::Application);
    assert_eq!(err.to_string(), "Application error: insufficient funds");
    assert_eq!(cluster.read_committed("a"), None);
    assert!(session.last_bookmark().is_empty());
}

#[tokio::test]
async fn test_connection_drop_is_retried_on_a_fresh_connection() {
    let cluster = InMemoryCluster::new(DATABASE);
    let writer = cluster.writer();
    let driver = cluster_driver(&cluster);
    cluster.inject_fault(&writer, Fault::DropOnRun);
    let mut session = assert_ok!(driver.session(SessionConfig::default()));

    assert_ok!(
        session
            .execute_write(|tx| async move {
                tx.run(put("a", 1)).await?;
                Ok::<_, DriverError>(())
            })
            .await
    );

    let stats = driver.stats(&writer);
    assert_eq!(stats.created, 2);
    assert_eq!(stats.discarded, 1);
    assert_eq!(stats.idle_connections, 1);
    assert_eq!(stats.in_use_connections, 0);
}

#[tokio::test]
async fn test_lost_commit_reply_replays_idempotent_work() {
    let cluster = InMemoryCluster::new(DATABASE);
    let driver = cluster_driver(&cluster);
    cluster.inject_fault(&cluster.writer(), Fault::DropAfterCommit);
    let mut session = assert_ok!(driver.session(SessionConfig::default()));

    // PUT is idempotent, so replaying it after an unknown outcome is safe
    assert_ok!(
        session
            .execute_write(|tx| async move {
                tx.run(put("a", 5)).await?;
                Ok::<_, DriverError>(())
            })
            .await
    );

    assert_eq!(cluster.read_committed("a"), Some(json!(5)));
    assert_eq!(session.last_bookmark_tokens().len(), 1);
}

#[tokio::test]
async fn test_routing_failures_are_retried_until_topology_heals() {
    let cluster = InMemoryCluster::new(DATABASE).with_replicas(1);
    let replica = cluster.replicas()[0].clone();
    let router = Arc::new(StaticRouter::new().with_table(
        DATABASE,
        RoutingTable::new(vec![replica.clone()], Vec::new()),
    ));
    let policy = RetryPolicy {
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(20),
        jitter_factor: 0.0,
        ..RetryPolicy::immediate(Duration::from_secs(3))
    };
    let driver = driver_with(&cluster, router.clone(), policy);

    let healer = {
        let router = Arc::clone(&router);
        let table = cluster.routing_table();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            router.set_table(DATABASE, table).await;
        })
    };

    let mut session = assert_ok!(driver.session(SessionConfig::default()));
    assert_ok!(
        session
            .execute_write(|tx| async move {
                tx.run(put("a", 1)).await?;
                Ok::<_, DriverError>(())
            })
            .await
    );
    assert_ok!(healer.await);
    assert_eq!(cluster.read_committed("a"), Some(json!(1)));
}

#[tokio::test]
async fn test_stale_writer_is_reported_until_topology_is_updated() {
    let cluster = InMemoryCluster::new(DATABASE).with_replicas(1);
    let old_writer = cluster.writer();
    let new_writer = cluster.replicas()[0].clone();
    let router = Arc::new(CountingRouter::new(
        StaticRouter::new().with_table(DATABASE, cluster.routing_table()),
    ));
    let driver = driver_with(
        &cluster,
        router.clone(),
        RetryPolicy::immediate(Duration::from_millis(200)),
    );

    cluster.promote(&new_writer);

    let mut session = assert_ok!(driver.session(SessionConfig::default()));
    let err = assert_err!(
        session
            .execute_write(|tx| async move { tx.run(put("a", 1)).await })
            .await
    );
    match &err {
        DriverError::RetriesExhausted { causes, .. } => {
            assert!(causes.iter().all(|cause| cause.kind() == ErrorKind::Routing));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(router.failures.load(Ordering::SeqCst) > 0);
    assert!(cluster.begin_count(&old_writer) > 0);
    assert_eq!(cluster.begin_count(&new_writer), 0);

    // Once the application learns the new topology, writes go through
    router.inner.set_table(DATABASE, cluster.routing_table()).await;
    assert_ok!(
        session
            .execute_write(|tx| async move { tx.run(put("a", 1)).await })
            .await
    );
    assert_eq!(cluster.read_committed("a"), Some(json!(1)));
}

#[tokio::test]
async fn test_attempt_timeout_cancels_slow_work() {
    let cluster = InMemoryCluster::new(DATABASE);
    let policy = RetryPolicy::immediate(Duration::from_secs(2))
        .with_attempt_timeout(Duration::from_millis(30));
    let driver = driver_with(
        &cluster,
        Arc::new(StaticRouter::direct(cluster.writer())),
        policy,
    );
    let mut session = assert_ok!(driver.session(SessionConfig::default()));
    let calls = AtomicUsize::new(0);

    let value = assert_ok!(
        session
            .execute_write(|tx| {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    tx.run(put("a", call as i64)).await?;
                    if call == 0 {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                    read_value(&tx, "a").await
                }
            })
            .await
    );

    assert_eq!(value, Some(json!(1)));
    assert_eq!(cluster.read_committed("a"), Some(json!(1)));
    let stats = driver.stats(&cluster.writer());
    assert_eq!(stats.discarded, 1);
    assert_eq!(stats.in_use_connections, 0);
}

#[tokio::test]
async fn test_stalled_commit_is_abandoned_and_retried() {
    let cluster = InMemoryCluster::new(DATABASE);
    let writer = cluster.writer();
    let policy = RetryPolicy::immediate(Duration::from_secs(1))
        .with_attempt_timeout(Duration::from_millis(50));
    let driver = driver_with(&cluster, Arc::new(StaticRouter::direct(writer.clone())), policy);
    cluster.inject_fault(&writer, Fault::StallOnCommit);
    let mut session = assert_ok!(driver.session(SessionConfig::default()));

    let outcome = tokio::time::timeout(
        Duration::from_secs(3),
        session.execute_write(|tx| async move {
            tx.run(put("a", "paid")).await?;
            Ok::<_, DriverError>(())
        }),
    )
    .await
    .expect("runner must not hang on an unanswered commit");

    assert_ok!(outcome);
    assert_eq!(cluster.read_committed("a"), Some(json!("paid")));
    let stats = driver.stats(&writer);
    assert_eq!(stats.discarded, 1);
    assert_eq!(stats.in_use_connections, 0);
    assert!(!session.last_bookmark().is_empty());
}
