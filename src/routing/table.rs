use super::Router;
use crate::core::{AccessMode, DriverError, ErrorKind, Result, ServerAddress};
use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

/// Cluster roles for one database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTable {
    #[serde(default)]
    pub readers: Vec<ServerAddress>,
    #[serde(default)]
    pub writers: Vec<ServerAddress>,
}

impl RoutingTable {
    pub fn new(readers: Vec<ServerAddress>, writers: Vec<ServerAddress>) -> Self {
        Self { readers, writers }
    }

    /// A table where one server plays every role.
    pub fn single(address: ServerAddress) -> Self {
        Self {
            readers: vec![address.clone()],
            writers: vec![address],
        }
    }

    pub fn servers_for(&self, mode: AccessMode) -> &[ServerAddress] {
        match mode {
            AccessMode::Read => &self.readers,
            AccessMode::Write => &self.writers,
        }
    }

    /// Removes `address` from the writer list. Returns true if it was present.
    pub fn forget_writer(&mut self, address: &ServerAddress) -> bool {
        let before = self.writers.len();
        self.writers.retain(|w| w != address);
        before != self.writers.len()
    }

    /// Removes `address` from every role. Returns true if it was present.
    pub fn forget(&mut self, address: &ServerAddress) -> bool {
        let before = self.readers.len() + self.writers.len();
        self.readers.retain(|r| r != address);
        self.writers.retain(|w| w != address);
        before != self.readers.len() + self.writers.len()
    }
}

/// [`Router`] backed by routing tables the application supplies.
///
/// Servers are handed out round-robin within a role. Per-database tables are
/// pruned on failure reports. When pruning leaves a role empty, the request
/// fails with a routing error and the table the application configured is
/// reinstated, so forgotten servers are probed again on the next attempt.
/// Tables can be replaced wholesale when the application learns a newer
/// topology. The fallback table, used for databases without their own
/// table, describes a fixed entry point and is never pruned.
pub struct StaticRouter {
    tables: RwLock<HashMap<String, KnownTable>>,
    fallback: Option<RoutingTable>,
    cursor: AtomicUsize,
}

struct KnownTable {
    /// As supplied by the application
    configured: RoutingTable,
    /// `configured` minus the servers forgotten since
    current: RoutingTable,
}

impl KnownTable {
    fn new(table: RoutingTable) -> Self {
        Self {
            current: table.clone(),
            configured: table,
        }
    }
}

impl StaticRouter {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            fallback: None,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Routes every database and mode to a single server.
    pub fn direct(address: ServerAddress) -> Self {
        Self {
            fallback: Some(RoutingTable::single(address)),
            ..Self::new()
        }
    }

    pub fn with_table(mut self, database: impl Into<String>, table: RoutingTable) -> Self {
        self.tables
            .get_mut()
            .insert(database.into(), KnownTable::new(table));
        self
    }

    pub fn with_fallback(mut self, table: RoutingTable) -> Self {
        self.fallback = Some(table);
        self
    }

    /// Installs a new table for `database`, replacing what was known.
    pub async fn set_table(&self, database: impl Into<String>, table: RoutingTable) {
        let database = database.into();
        info!(
            "Routing table for '{}' updated: {} reader(s), {} writer(s)",
            database,
            table.readers.len(),
            table.writers.len()
        );
        self.tables
            .write()
            .await
            .insert(database, KnownTable::new(table));
    }

    /// The table currently used for `database`, after pruning.
    pub async fn table(&self, database: &str) -> Option<RoutingTable> {
        let tables = self.tables.read().await;
        tables
            .get(database)
            .map(|known| known.current.clone())
            .or_else(|| self.fallback.clone())
    }

    async fn reinstate(&self, database: &str) {
        let mut tables = self.tables.write().await;
        if let Some(known) = tables.get_mut(database) {
            if known.current != known.configured {
                debug!("Reinstating configured routing table for '{}'", database);
                known.current = known.configured.clone();
            }
        }
    }
}

impl Default for StaticRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Router for StaticRouter {
    async fn route(&self, mode: AccessMode, database: &str) -> Result<ServerAddress> {
        {
            let tables = self.tables.read().await;
            let table = tables
                .get(database)
                .map(|known| &known.current)
                .or(self.fallback.as_ref())
                .ok_or_else(|| {
                    DriverError::Routing(format!("no routing table for database '{database}'"))
                })?;

            let servers = table.servers_for(mode);
            if !servers.is_empty() {
                let index = self.cursor.fetch_add(1, Ordering::Relaxed) % servers.len();
                return Ok(servers[index].clone());
            }
        }

        self.reinstate(database).await;
        Err(DriverError::Routing(format!(
            "no {mode} server known for database '{database}'"
        )))
    }

    async fn on_failure(&self, address: &ServerAddress, database: &str, error: &DriverError) {
        let mut tables = self.tables.write().await;
        let Some(known) = tables.get_mut(database) else {
            return;
        };
        let table = &mut known.current;

        match (error.kind(), error) {
            (_, DriverError::PoolTimeout { .. }) => {}
            (ErrorKind::Routing, _) => {
                if table.forget_writer(address) {
                    debug!("Forgot writer {} for '{}': {}", address, database, error);
                }
            }
            (ErrorKind::Connection, _) => {
                if table.forget(address) {
                    debug!("Forgot server {} for '{}': {}", address, database, error);
                }
            }
            _ => {}
        }
    }
}
