// Shared helpers for the scenario tests
#![allow(dead_code)]

use causaldb::{
    Driver, DriverConfig, DriverError, InMemoryCluster, Query, Result, RetryPolicy, Router,
    StaticRouter, Transaction,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub const DATABASE: &str = "foo";

pub fn put(key: &str, value: impl Into<Value>) -> Query {
    Query::new("PUT").param("key", key).param("value", value.into())
}

pub fn get(key: &str) -> Query {
    Query::new("GET").param("key", key)
}

/// Reads `key` inside `tx`.
pub async fn read_value(tx: &Transaction, key: &str) -> Result<Option<Value>> {
    let result = tx.run(get(key)).await?;
    Ok(result.single().and_then(|record| record.get("value").cloned()))
}

pub fn test_config() -> DriverConfig {
    DriverConfig::new(DATABASE)
        .max_connection_pool_size(4)
        .connection_acquisition_timeout(Duration::from_millis(200))
        .max_transaction_retry_time(Duration::from_secs(2))
}

/// Driver over `cluster` that routes with the cluster's own routing table
/// and retries without waiting.
pub fn cluster_driver(cluster: &InMemoryCluster) -> Driver {
    let router = StaticRouter::new().with_table(DATABASE, cluster.routing_table());
    driver_with(cluster, Arc::new(router), RetryPolicy::immediate(Duration::from_secs(2)))
}

pub fn driver_with(cluster: &InMemoryCluster, router: Arc<dyn Router>, policy: RetryPolicy) -> Driver {
    Driver::builder(test_config(), router, Arc::new(cluster.clone()))
        .retry_policy(policy)
        .build()
        .expect("valid test driver")
}

pub fn transient() -> DriverError {
    DriverError::transient("TransientError.Transaction.DeadlockDetected", "deadlock")
}
