use super::types::ServerAddress;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Status codes the server uses for a transaction that was killed on purpose.
///
/// They are labelled transient by the server but retrying them would undo an
/// explicit termination, so they surface as client errors.
const TERMINATION_CODES: &[&str] = &[
    "TransientError.Transaction.Terminated",
    "TransientError.Transaction.LockClientStopped",
];

/// Status codes that mean the chosen server cannot accept writes any more.
const STALE_WRITER_CODES: &[&str] = &[
    "ClientError.Cluster.NotALeader",
    "ClientError.General.ForbiddenOnReadOnlyDatabase",
];

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Client error [{code}]: {message}")]
    Client { code: String, message: String },

    #[error("Transient error [{code}]: {message}")]
    Transient { code: String, message: String },

    #[error("Database error [{code}]: {message}")]
    Database { code: String, message: String },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Commit outcome unknown: {0}")]
    IndeterminateCommit(String),

    #[error("Connection pool timeout: no connection to {address} available within {timeout:?}")]
    PoolTimeout {
        address: ServerAddress,
        timeout: Duration,
    },

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Routing error: {0}")]
    Routing(String),

    #[error("Session busy: a transaction is already open on this session")]
    SessionBusy,

    #[error("Session is closed")]
    SessionClosed,

    #[error("Transaction is closed (state: {state})")]
    TransactionClosed { state: String },

    #[error("Invalid bookmark: {0}")]
    InvalidBookmark(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(
        "Transaction retries exhausted after {attempts} attempt(s) in {elapsed:?}: {}",
        last_cause(.causes)
    )]
    RetriesExhausted {
        attempts: usize,
        elapsed: Duration,
        causes: Vec<DriverError>,
    },

    #[error("Application error: {0}")]
    Application(anyhow::Error),

    #[error("Lock error: {0}")]
    LockError(String),
}

fn last_cause(causes: &[DriverError]) -> String {
    causes
        .last()
        .map(ToString::to_string)
        .unwrap_or_else(|| "no recorded cause".to_string())
}

/// Coarse error classes used for retry decisions and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Client,
    Transient,
    Database,
    Connection,
    Routing,
    Application,
    RetriesExhausted,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Client => "client",
            Self::Transient => "transient",
            Self::Database => "database",
            Self::Connection => "connection",
            Self::Routing => "routing",
            Self::Application => "application",
            Self::RetriesExhausted => "retries_exhausted",
        };
        write!(f, "{label}")
    }
}

impl DriverError {
    pub fn client(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Client {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn database(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Database {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Wraps an error raised by application code inside a transaction function.
    pub fn application(err: impl Into<anyhow::Error>) -> Self {
        Self::Application(err.into())
    }

    /// Builds the error for a failure reported by the server.
    ///
    /// The classification segment of `code` picks the variant; codes without
    /// a recognised classification are treated as database errors.
    pub fn from_server_failure(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        let message = message.into();

        if matches_any(&code, STALE_WRITER_CODES) {
            return Self::Routing(format!("[{code}] {message}"));
        }
        if matches_any(&code, TERMINATION_CODES) {
            return Self::Client { code, message };
        }

        match classification(&code) {
            Some("ClientError") => Self::Client { code, message },
            Some("TransientError") => Self::Transient { code, message },
            _ => Self::Database { code, message },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Client { .. }
            | Self::SessionBusy
            | Self::SessionClosed
            | Self::TransactionClosed { .. }
            | Self::InvalidBookmark(_)
            | Self::Configuration(_)
            | Self::PoolClosed => ErrorKind::Client,
            Self::Transient { .. } => ErrorKind::Transient,
            Self::Database { .. } | Self::LockError(_) => ErrorKind::Database,
            Self::Connection(_) | Self::IndeterminateCommit(_) | Self::PoolTimeout { .. } => {
                ErrorKind::Connection
            }
            Self::Routing(_) => ErrorKind::Routing,
            Self::Application(_) => ErrorKind::Application,
            Self::RetriesExhausted { .. } => ErrorKind::RetriesExhausted,
        }
    }

    /// Server status code, when the error came from the server.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Client { code, .. } | Self::Transient { code, .. } | Self::Database { code, .. } => {
                Some(code.as_str())
            }
            _ => None,
        }
    }

    /// Returns true when the connection that produced this error must not be reused.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Connection)
    }
}

fn matches_any(code: &str, suffixes: &[&str]) -> bool {
    suffixes.iter().any(|suffix| code.ends_with(suffix))
}

fn classification(code: &str) -> Option<&str> {
    code.split('.')
        .find(|segment| matches!(*segment, "ClientError" | "TransientError" | "DatabaseError"))
}

pub type Result<T> = std::result::Result<T, DriverError>;

impl<T> From<std::sync::PoisonError<T>> for DriverError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}
