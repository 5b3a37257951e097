use super::{Batch, ClusterState, Fault, Role};
use crate::connection::{Request, Response, Transport};
use crate::core::{DriverError, Query, Record, Result, ServerAddress};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

const NOT_A_LEADER: &str = "ClientError.Cluster.NotALeader";
const SYNTAX_ERROR: &str = "ClientError.Statement.SyntaxError";
const ARGUMENT_ERROR: &str = "ClientError.Statement.ArgumentError";
const INVALID_REQUEST: &str = "ClientError.Request.Invalid";
const DATABASE_NOT_FOUND: &str = "ClientError.Database.DatabaseNotFound";
const INVALID_BOOKMARK: &str = "ClientError.Transaction.InvalidBookmark";

/// Server-side state of an open transaction.
struct OpenTransaction {
    /// Log batches visible to this transaction
    snapshot: usize,
    writes: Batch,
}

impl OpenTransaction {
    fn read(&self, state: &ClusterState, key: &str) -> Option<Value> {
        if let Some((_, value)) = self.writes.iter().rev().find(|(k, _)| k == key) {
            return value.clone();
        }
        state.snapshot(self.snapshot).remove(key)
    }

    fn view(&self, state: &ClusterState) -> BTreeMap<String, Value> {
        let mut store = state.snapshot(self.snapshot);
        for (key, value) in &self.writes {
            match value {
                Some(value) => store.insert(key.clone(), value.clone()),
                None => store.remove(key),
            };
        }
        store
    }
}

/// One client connection to a server of an [`super::InMemoryCluster`].
pub(super) struct MemoryTransport {
    cluster: Arc<Mutex<ClusterState>>,
    address: ServerAddress,
    open: Option<OpenTransaction>,
    healthy: bool,
}

impl MemoryTransport {
    pub(super) fn new(cluster: Arc<Mutex<ClusterState>>, address: ServerAddress) -> Self {
        Self {
            cluster,
            address,
            open: None,
            healthy: true,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.cluster.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn drop_connection(&mut self, context: &str) -> DriverError {
        self.healthy = false;
        self.open = None;
        DriverError::Connection(format!("connection to {} dropped {}", self.address, context))
    }

    /// Takes the next fault matching `request`, unless the server is down.
    fn next_fault(&self, request: &Request) -> Option<Fault> {
        let mut state = self.lock();
        let up = state
            .servers
            .get(&self.address)
            .is_some_and(|server| !server.down);
        if up {
            state.take_fault(&self.address, request)
        } else {
            None
        }
    }

    fn handle(&mut self, request: Request, fault: Option<Fault>) -> Result<Response> {
        let cluster = Arc::clone(&self.cluster);
        let mut state = cluster.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let down = state
            .servers
            .get(&self.address)
            .is_none_or(|server| server.down);
        if down {
            return Err(self.drop_connection("(server unavailable)"));
        }

        match fault {
            Some(Fault::Transient(code)) => {
                self.open = None;
                return Ok(failure(code, "injected transient failure"));
            }
            Some(Fault::Database(code)) => {
                self.open = None;
                return Ok(failure(code, "injected database failure"));
            }
            Some(Fault::DropOnRun) => return Err(self.drop_connection("during RUN")),
            Some(Fault::DropOnCommit) => return Err(self.drop_connection("before COMMIT")),
            Some(Fault::DropAfterCommit) => {
                commit(&mut state, &self.address, self.open.take());
                return Err(self.drop_connection("after COMMIT"));
            }
            Some(Fault::StallOnCommit) | None => {}
        }

        match request {
            Request::Begin {
                ref database,
                ref bookmarks,
                ..
            } => self.begin(&mut state, &request, database, bookmarks),
            Request::Run(query) => Ok(self.run(&state, query)),
            Request::Commit => match self.open.take() {
                Some(open) => {
                    let sequence = commit(&mut state, &self.address, Some(open));
                    Ok(Response::Success {
                        bookmark: Some(state.token(sequence)),
                    })
                }
                None => Ok(failure(INVALID_REQUEST, "COMMIT without an open transaction")),
            },
            Request::Rollback => {
                self.open = None;
                Ok(Response::Success { bookmark: None })
            }
        }
    }

    fn begin(
        &mut self,
        state: &mut ClusterState,
        request: &Request,
        database: &str,
        bookmarks: &[String],
    ) -> Result<Response> {
        if let Some(server) = state.servers.get_mut(&self.address) {
            server.last_begin = Some(request.clone());
        }

        if database != state.database {
            return Ok(failure(
                DATABASE_NOT_FOUND,
                format!("database '{database}' does not exist"),
            ));
        }
        if self.open.is_some() {
            return Ok(failure(INVALID_REQUEST, "a transaction is already open"));
        }

        let required = match state.parse_tokens(bookmarks) {
            Ok(required) => required,
            Err(message) => return Ok(failure(INVALID_BOOKMARK, message)),
        };
        let committed = state.log.len();
        if required > committed {
            return Ok(failure(
                INVALID_BOOKMARK,
                format!("bookmark {} is ahead of the cluster", state.token(required)),
            ));
        }

        let Some(server) = state.servers.get_mut(&self.address) else {
            return Err(self.drop_connection("(unknown server)"));
        };
        // Catch up far enough to honour the bookmark before starting
        server.applied = server.applied.max(required);
        server.begins += 1;
        self.open = Some(OpenTransaction {
            snapshot: server.applied,
            writes: Vec::new(),
        });
        Ok(Response::Success { bookmark: None })
    }

    fn run(&mut self, state: &ClusterState, query: Query) -> Response {
        let is_writer = state
            .servers
            .get(&self.address)
            .is_some_and(|server| server.role == Role::Writer);
        let Some(open) = self.open.as_mut() else {
            return failure(INVALID_REQUEST, "RUN without an open transaction");
        };

        let command = query.text.trim().to_ascii_uppercase();
        match command.as_str() {
            "PUT" | "DELETE" if !is_writer => failure(
                NOT_A_LEADER,
                format!("{} does not accept writes", self.address),
            ),
            "PUT" => {
                let (Some(key), Some(value)) = (key_param(&query), query.params.get("value"))
                else {
                    return failure(ARGUMENT_ERROR, "PUT expects 'key' and 'value'");
                };
                open.writes.push((key, Some(value.clone())));
                Response::Records(Vec::new())
            }
            "DELETE" => {
                let Some(key) = key_param(&query) else {
                    return failure(ARGUMENT_ERROR, "DELETE expects 'key'");
                };
                open.writes.push((key, None));
                Response::Records(Vec::new())
            }
            "GET" => {
                let Some(key) = key_param(&query) else {
                    return failure(ARGUMENT_ERROR, "GET expects 'key'");
                };
                let records = open
                    .read(state, &key)
                    .map(|value| {
                        vec![Record::from_iter([
                            ("key".to_string(), Value::from(key)),
                            ("value".to_string(), value),
                        ])]
                    })
                    .unwrap_or_default();
                Response::Records(records)
            }
            "COUNT" => {
                let count = open.view(state).len();
                Response::Records(vec![Record::from_iter([(
                    "count".to_string(),
                    Value::from(count),
                )])])
            }
            _ => failure(
                SYNTAX_ERROR,
                format!("unknown command '{}'", query.text.trim()),
            ),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&mut self, request: Request) -> Result<Response> {
        if !self.healthy {
            return Err(DriverError::Connection(format!(
                "connection to {} is closed",
                self.address
            )));
        }
        let fault = self.next_fault(&request);
        if fault == Some(Fault::StallOnCommit) {
            std::future::pending::<()>().await;
        }
        self.handle(request, fault)
    }

    async fn close(&mut self) {
        self.healthy = false;
        self.open = None;
    }

    fn is_healthy(&self) -> bool {
        self.healthy && !self.lock().servers.get(&self.address).is_none_or(|s| s.down)
    }
}

/// Appends the transaction's writes to the log and returns the sequence the
/// committing server has reached.
fn commit(state: &mut ClusterState, address: &ServerAddress, open: Option<OpenTransaction>) -> usize {
    let writes = open.map(|open| open.writes).unwrap_or_default();
    if !writes.is_empty() {
        state.log.push(writes);
    }
    let committed = state.log.len();
    match state.servers.get_mut(address) {
        Some(server) if server.role == Role::Writer => {
            server.applied = committed;
            committed
        }
        Some(server) => server.applied,
        None => committed,
    }
}

fn key_param(query: &Query) -> Option<String> {
    query
        .params
        .get("key")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn failure(code: impl Into<String>, message: impl Into<String>) -> Response {
    Response::Failure {
        code: code.into(),
        message: message.into(),
    }
}
