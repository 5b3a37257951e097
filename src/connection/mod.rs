pub mod config;
pub mod pool;

use crate::core::{AccessMode, DriverError, Query, Record, Result, ServerAddress};
use async_trait::async_trait;
use log::debug;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Messages the driver sends over a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Begin {
        database: String,
        access_mode: AccessMode,
        bookmarks: Vec<String>,
        timeout: Option<Duration>,
        metadata: BTreeMap<String, serde_json::Value>,
    },
    Run(Query),
    Commit,
    Rollback,
}

impl Request {
    fn name(&self) -> &'static str {
        match self {
            Request::Begin { .. } => "BEGIN",
            Request::Run(_) => "RUN",
            Request::Commit => "COMMIT",
            Request::Rollback => "ROLLBACK",
        }
    }
}

/// Structured reply to a [`Request`].
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Request accepted. `COMMIT` replies carry the new bookmark token.
    Success { bookmark: Option<String> },
    /// Records streamed back for a `RUN`.
    Records(Vec<Record>),
    /// The server rejected the request.
    Failure { code: String, message: String },
}

/// Byte-level exchange with one server, supplied by the embedding application.
///
/// `send` fails only for connection-level problems; server-side rejections
/// come back as [`Response::Failure`].
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, request: Request) -> Result<Response>;

    async fn close(&mut self);

    fn is_healthy(&self) -> bool;
}

/// Opens transports to cluster members.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, address: &ServerAddress) -> Result<Box<dyn Transport>>;
}

/// A server connection owned by at most one transaction at a time.
pub struct Connection {
    /// Unique connection ID
    id: u64,
    address: ServerAddress,
    /// Mode the current lease was routed for
    access_mode: AccessMode,
    transport: Box<dyn Transport>,
    healthy: bool,
    created_at: Instant,
    last_used: Instant,
}

impl Connection {
    pub(crate) fn new(id: u64, address: ServerAddress, transport: Box<dyn Transport>) -> Self {
        let now = Instant::now();
        Self {
            id,
            address,
            access_mode: AccessMode::default(),
            transport,
            healthy: true,
            created_at: now,
            last_used: now,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub fn access_mode(&self) -> AccessMode {
        self.access_mode
    }

    pub(crate) fn set_access_mode(&mut self, mode: AccessMode) {
        self.access_mode = mode;
    }

    /// Sends one request. Any transport error marks the connection unhealthy.
    pub async fn send(&mut self, request: Request) -> Result<Response> {
        if !self.healthy {
            return Err(DriverError::Connection(format!(
                "connection {} to {} is no longer usable",
                self.id, self.address
            )));
        }

        let name = request.name();
        self.last_used = Instant::now();
        match self.transport.send(request).await {
            Ok(response) => {
                if !self.transport.is_healthy() {
                    self.healthy = false;
                }
                Ok(response)
            }
            Err(err) => {
                debug!(
                    "{} on connection {} to {} failed: {}",
                    name, self.id, self.address, err
                );
                self.healthy = false;
                Err(match err {
                    DriverError::Connection(_) => err,
                    other => DriverError::Connection(other.to_string()),
                })
            }
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy && self.transport.is_healthy()
    }

    /// Marks the connection as unusable so the pool closes it on release.
    pub fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }

    pub(crate) fn is_expired(&self, max_lifetime: Option<Duration>) -> bool {
        max_lifetime.is_some_and(|lifetime| self.created_at.elapsed() > lifetime)
    }

    pub(crate) fn is_idle_too_long(&self, idle_timeout: Option<Duration>) -> bool {
        idle_timeout.is_some_and(|timeout| self.last_used.elapsed() > timeout)
    }

    pub(crate) fn refresh_last_used(&mut self) {
        self.last_used = Instant::now();
    }

    pub(crate) async fn close(&mut self) {
        self.healthy = false;
        self.transport.close().await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("access_mode", &self.access_mode)
            .field("healthy", &self.healthy)
            .finish()
    }
}
