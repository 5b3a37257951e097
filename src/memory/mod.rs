// ============================================================================
// In-Memory Cluster
// ============================================================================
//
// A causally consistent key/value cluster that lives inside the process. It
// stands in for a real server wherever the driver needs one: unit tests,
// scenario tests, demos.
//
// One writer owns the commit log. Read replicas apply a prefix of that log and
// only move forward when told to (`replicate`) or when a transaction begins
// with a bookmark newer than what they have applied. Bookmark tokens have the
// form `<database>:<sequence>`, where the sequence is the log length right
// after the commit.
//
// ============================================================================

mod server;

use crate::connection::{Connector, Request, Transport};
use crate::core::{DriverError, Result, ServerAddress};
use crate::routing::RoutingTable;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use server::MemoryTransport;

/// Failure injected into the next matching request a server handles.
///
/// Each injected fault fires once.
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    /// The next `RUN` fails with this transient status code
    Transient(String),
    /// The next `RUN` fails with this non-transient database status code
    Database(String),
    /// The connection drops while the next `RUN` is in flight
    DropOnRun,
    /// The connection drops before the next `COMMIT` is applied
    DropOnCommit,
    /// The next `COMMIT` is applied but its reply is lost
    DropAfterCommit,
    /// The next `COMMIT` is never answered
    StallOnCommit,
}

impl Fault {
    fn fires_on(&self, request: &Request) -> bool {
        match self {
            Fault::Transient(_) | Fault::Database(_) | Fault::DropOnRun => {
                matches!(request, Request::Run(_))
            }
            Fault::DropOnCommit | Fault::DropAfterCommit | Fault::StallOnCommit => {
                matches!(request, Request::Commit)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Writer,
    Replica,
}

/// One committed transaction: keys written, `None` for deletes.
type Batch = Vec<(String, Option<Value>)>;

struct ServerState {
    role: Role,
    /// Number of log batches this server has applied
    applied: usize,
    down: bool,
    faults: VecDeque<Fault>,
    last_begin: Option<Request>,
    begins: usize,
}

impl ServerState {
    fn new(role: Role, applied: usize) -> Self {
        Self {
            role,
            applied,
            down: false,
            faults: VecDeque::new(),
            last_begin: None,
            begins: 0,
        }
    }
}

pub(crate) struct ClusterState {
    database: String,
    writer: ServerAddress,
    log: Vec<Batch>,
    servers: HashMap<ServerAddress, ServerState>,
}

impl ClusterState {
    /// Key/value view after applying the first `applied` batches.
    fn snapshot(&self, applied: usize) -> BTreeMap<String, Value> {
        let mut store = BTreeMap::new();
        for batch in self.log.iter().take(applied) {
            for (key, value) in batch {
                match value {
                    Some(value) => store.insert(key.clone(), value.clone()),
                    None => store.remove(key),
                };
            }
        }
        store
    }

    fn token(&self, sequence: usize) -> String {
        format!("{}:{}", self.database, sequence)
    }

    /// Highest sequence among `tokens` that belong to this cluster's database.
    fn parse_tokens(&self, tokens: &[String]) -> std::result::Result<usize, String> {
        let prefix = format!("{}:", self.database);
        let mut highest = 0;
        for token in tokens {
            let sequence = token
                .strip_prefix(&prefix)
                .and_then(|rest| rest.parse::<usize>().ok())
                .ok_or_else(|| format!("malformed bookmark token '{token}'"))?;
            highest = highest.max(sequence);
        }
        Ok(highest)
    }

    fn take_fault(&mut self, address: &ServerAddress, request: &Request) -> Option<Fault> {
        let server = self.servers.get_mut(address)?;
        let position = server.faults.iter().position(|fault| fault.fires_on(request))?;
        server.faults.remove(position)
    }
}

/// Handle to an in-process cluster. Clones share the same cluster.
///
/// Implements [`Connector`], so it can be handed straight to a driver or a
/// connection pool.
#[derive(Clone)]
pub struct InMemoryCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl InMemoryCluster {
    /// A cluster serving `database` with a single writer and no replicas.
    pub fn new(database: impl Into<String>) -> Self {
        let writer = ServerAddress::new("core-1", ServerAddress::DEFAULT_PORT);
        let mut servers = HashMap::new();
        servers.insert(writer.clone(), ServerState::new(Role::Writer, 0));

        Self {
            state: Arc::new(Mutex::new(ClusterState {
                database: database.into(),
                writer,
                log: Vec::new(),
                servers,
            })),
        }
    }

    /// Adds `count` read replicas. They start caught up and lag from then on.
    pub fn with_replicas(self, count: usize) -> Self {
        {
            let mut state = self.lock();
            let applied = state.log.len();
            let existing = state
                .servers
                .values()
                .filter(|server| server.role == Role::Replica)
                .count();
            for i in 0..count {
                let address =
                    ServerAddress::new(format!("replica-{}", existing + i + 1), ServerAddress::DEFAULT_PORT);
                state
                    .servers
                    .insert(address, ServerState::new(Role::Replica, applied));
            }
        }
        self
    }

    pub fn database(&self) -> String {
        self.lock().database.clone()
    }

    pub fn writer(&self) -> ServerAddress {
        self.lock().writer.clone()
    }

    pub fn replicas(&self) -> Vec<ServerAddress> {
        let state = self.lock();
        let mut replicas: Vec<_> = state
            .servers
            .iter()
            .filter(|(_, server)| server.role == Role::Replica)
            .map(|(address, _)| address.clone())
            .collect();
        replicas.sort();
        replicas
    }

    /// Routing table with the writer and every replica.
    ///
    /// Replicas serve reads; the writer only serves reads when there are no
    /// replicas.
    pub fn routing_table(&self) -> RoutingTable {
        let writer = self.writer();
        let replicas = self.replicas();
        let readers = if replicas.is_empty() {
            vec![writer.clone()]
        } else {
            replicas
        };
        RoutingTable::new(readers, vec![writer])
    }

    /// Queues `fault` on the server at `address`.
    pub fn inject_fault(&self, address: &ServerAddress, fault: Fault) {
        if let Some(server) = self.lock().servers.get_mut(address) {
            server.faults.push_back(fault);
        }
    }

    /// Takes a server down or brings it back. A down server refuses new
    /// connections and breaks existing ones on their next request.
    pub fn set_down(&self, address: &ServerAddress, down: bool) {
        if let Some(server) = self.lock().servers.get_mut(address) {
            server.down = down;
        }
    }

    /// Moves the writer role to `address`; the old writer becomes a replica.
    pub fn promote(&self, address: &ServerAddress) {
        let mut state = self.lock();
        if !state.servers.contains_key(address) {
            return;
        }
        let applied = state.log.len();
        let old = state.writer.clone();
        if let Some(server) = state.servers.get_mut(&old) {
            server.role = Role::Replica;
        }
        if let Some(server) = state.servers.get_mut(address) {
            server.role = Role::Writer;
            server.applied = applied;
        }
        state.writer = address.clone();
    }

    /// Brings every replica up to date with the writer.
    pub fn replicate(&self) {
        let mut state = self.lock();
        let applied = state.log.len();
        for server in state.servers.values_mut() {
            server.applied = applied;
        }
    }

    /// The most recent `BEGIN` the server at `address` received.
    pub fn last_begin(&self, address: &ServerAddress) -> Option<Request> {
        self.lock()
            .servers
            .get(address)
            .and_then(|server| server.last_begin.clone())
    }

    /// Number of `BEGIN`s the server at `address` has accepted.
    pub fn begin_count(&self, address: &ServerAddress) -> usize {
        self.lock()
            .servers
            .get(address)
            .map(|server| server.begins)
            .unwrap_or(0)
    }

    /// Log batches applied by the server at `address`.
    pub fn applied(&self, address: &ServerAddress) -> usize {
        self.lock()
            .servers
            .get(address)
            .map(|server| server.applied)
            .unwrap_or(0)
    }

    /// Latest committed value of `key`, as the writer sees it.
    pub fn read_committed(&self, key: &str) -> Option<Value> {
        let state = self.lock();
        state.snapshot(state.log.len()).remove(key)
    }

    /// Bookmark token for the latest commit.
    pub fn latest_token(&self) -> String {
        let state = self.lock();
        state.token(state.log.len())
    }

    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Connector for InMemoryCluster {
    async fn connect(&self, address: &ServerAddress) -> Result<Box<dyn Transport>> {
        let state = self.lock();
        match state.servers.get(address) {
            Some(server) if server.down => Err(DriverError::Connection(format!(
                "connection refused by {address}"
            ))),
            Some(_) => Ok(Box::new(MemoryTransport::new(
                Arc::clone(&self.state),
                address.clone(),
            ))),
            None => Err(DriverError::Connection(format!("unknown host {address}"))),
        }
    }
}
