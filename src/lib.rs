// ============================================================================
// causaldb Client Library
// ============================================================================

pub mod bookmark;
pub mod connection;
pub mod core;
pub mod memory;
pub mod retry;
pub mod routing;
pub mod session;
pub mod transaction;

// Re-export main types for convenience
pub use crate::bookmark::Bookmark;
pub use crate::core::{
    AccessMode, DriverError, ErrorKind, Params, Query, QueryResult, Record, Result, ServerAddress,
};
pub use crate::memory::{Fault, InMemoryCluster};
pub use crate::retry::{
    DefaultRetryClassifier, RetryClassifier, RetryPolicy, RunOutcome, TransactionRunner,
};
pub use crate::routing::{Router, RoutingTable, StaticRouter};
pub use crate::session::{Session, SessionConfig};
pub use crate::transaction::{Transaction, TransactionConfig, TransactionId, TransactionState};

// Re-export connection API
pub use crate::connection::{
    Connection, Connector, Request, Response, Transport,
    config::DriverConfig,
    pool::{ConnectionPool, PoolGuard, PoolSettings, PoolStats},
};

use log::info;
use crate::session::DriverContext;
use std::sync::Arc;

// ============================================================================
// Driver
// ============================================================================

/// Entry point for applications
///
/// Owns the connection pool, the router and the retry machinery, and hands
/// out [`Session`]s that share them. Cheap to clone.
///
/// # Examples
///
/// ```
/// use causaldb::{Driver, DriverConfig, InMemoryCluster, Query, SessionConfig};
/// use std::sync::Arc;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> causaldb::Result<()> {
/// let cluster = InMemoryCluster::new("shop");
/// let config = DriverConfig::new("shop").seed_address(cluster.writer());
/// let driver = Driver::direct(config, Arc::new(cluster.clone()))?;
///
/// let mut session = driver.session(SessionConfig::default())?;
/// session
///     .execute_write(|tx| async move {
///         tx.run(Query::new("PUT").param("key", "apples").param("value", 3))
///             .await?;
///         Ok::<_, causaldb::DriverError>(())
///     })
///     .await?;
///
/// let bookmark = session.last_bookmark();
/// assert!(!bookmark.is_empty());
/// session.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Driver {
    context: Arc<DriverContext>,
}

impl Driver {
    /// Driver with the default retry policy and classifier.
    pub fn new(
        config: DriverConfig,
        router: Arc<dyn Router>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        Self::builder(config, router, connector).build()
    }

    /// Driver that sends every transaction to the config's seed address.
    pub fn direct(config: DriverConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        let seed = config.seed_address.clone().ok_or_else(|| {
            DriverError::Configuration("a direct driver needs a seed address".to_string())
        })?;
        Self::new(config, Arc::new(StaticRouter::direct(seed)), connector)
    }

    pub fn builder(
        config: DriverConfig,
        router: Arc<dyn Router>,
        connector: Arc<dyn Connector>,
    ) -> DriverBuilder {
        DriverBuilder {
            policy: RetryPolicy::from(&config),
            config,
            router,
            connector,
            classifier: Arc::new(DefaultRetryClassifier::new()),
        }
    }

    /// Opens a session. Fails if the session's bookmark belongs to another database.
    pub fn session(&self, config: SessionConfig) -> Result<Session> {
        if self.context.pool.is_closed() {
            return Err(DriverError::PoolClosed);
        }
        Session::new(Arc::clone(&self.context), config)
    }

    pub fn config(&self) -> &DriverConfig {
        &self.context.config
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.context.pool
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        self.context.runner.policy()
    }

    /// Pool statistics for one server.
    pub fn stats(&self, address: &ServerAddress) -> PoolStats {
        self.context.pool.stats(address)
    }

    /// Pool statistics for every server the driver has talked to.
    pub fn all_stats(&self) -> Vec<PoolStats> {
        self.context
            .pool
            .addresses()
            .iter()
            .map(|address| self.context.pool.stats(address))
            .collect()
    }

    /// Closes the pool. Sessions opened earlier fail on their next transaction.
    pub async fn close(&self) {
        info!("Closing driver for database '{}'", self.context.config.database);
        self.context.pool.close().await;
    }
}

/// Assembles a [`Driver`] with a custom retry policy or classifier.
pub struct DriverBuilder {
    config: DriverConfig,
    router: Arc<dyn Router>,
    connector: Arc<dyn Connector>,
    policy: RetryPolicy,
    classifier: Arc<dyn RetryClassifier>,
}

impl DriverBuilder {
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn classifier(mut self, classifier: Arc<dyn RetryClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn build(self) -> Result<Driver> {
        self.config.validate()?;
        self.policy.validate()?;
        let pool = ConnectionPool::new(PoolSettings::from(&self.config), self.connector)?;
        let runner = TransactionRunner::new(
            pool.clone(),
            Arc::clone(&self.router),
            self.policy,
            self.classifier,
        );
        info!(
            "Driver ready for database '{}' (max {} connection(s) per server)",
            self.config.database, self.config.max_connection_pool_size
        );

        Ok(Driver {
            context: Arc::new(DriverContext {
                config: self.config,
                pool,
                router: self.router,
                runner,
            }),
        })
    }
}
