use super::state::{TransactionId, TransactionState};
use crate::bookmark::{Bookmark, BookmarkLink, merge_into};
use crate::connection::pool::PoolGuard;
use crate::connection::{Request, Response};
use crate::core::{AccessMode, DriverError, Query, QueryResult, Result, ServerAddress};
use crate::retry::RetryClassifier;
use log::{debug, warn};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Per-transaction settings sent to the server with `BEGIN`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionConfig {
    /// Server-side limit on how long the transaction may run
    pub timeout: Option<Duration>,
    /// Free-form tags shown in server-side monitoring
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl TransactionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Everything needed to open a transaction on a leased connection.
pub(crate) struct BeginParams<'a> {
    pub database: &'a str,
    pub access_mode: AccessMode,
    pub bookmark: &'a Bookmark,
    pub config: &'a TransactionConfig,
    pub session: BookmarkLink,
    /// Set by the retry runner. A server failure this classifier would
    /// retry discards the connection instead of returning it to the pool.
    pub classifier: Option<Arc<dyn RetryClassifier>>,
}

/// Handle to an open transaction.
///
/// Handles are cheap to clone and all clones drive the same transaction,
/// which lets a transaction function own its handle while the runner keeps
/// one to commit with. The transaction owns its connection exclusively;
/// every operation takes an internal lock, so two clones never talk to the
/// server at once.
#[derive(Clone)]
pub struct Transaction {
    id: TransactionId,
    inner: Arc<Mutex<TransactionInner>>,
}

pub(crate) struct TransactionInner {
    id: TransactionId,
    state: TransactionState,
    database: String,
    access_mode: AccessMode,
    address: ServerAddress,
    /// Queries issued so far, in order
    queries: Vec<Query>,
    connection: Option<PoolGuard>,
    /// Bookmark produced by a successful commit
    bookmark: Option<Bookmark>,
    session: BookmarkLink,
    classifier: Option<Arc<dyn RetryClassifier>>,
    started: Instant,
}

impl Transaction {
    /// Sends `BEGIN` on `guard` and wraps it in a transaction handle.
    ///
    /// On failure the connection is released, or discarded if the failure
    /// was connection-level.
    pub(crate) async fn begin(mut guard: PoolGuard, params: BeginParams<'_>) -> Result<Self> {
        let id = TransactionId::new();
        let connection = guard.connection();
        connection.set_access_mode(params.access_mode);
        let address = connection.address().clone();

        let request = Request::Begin {
            database: params.database.to_string(),
            access_mode: params.access_mode,
            bookmarks: params
                .bookmark
                .tokens_for(params.database)
                .map(str::to_string)
                .collect(),
            timeout: params.config.timeout,
            metadata: params.config.metadata.clone(),
        };

        match connection.send(request).await {
            Ok(Response::Success { .. }) => {}
            Ok(Response::Failure { code, message }) => {
                let err = DriverError::from_server_failure(code, message);
                if is_retryable(params.classifier.as_deref(), &err) {
                    guard.discard().await;
                } else {
                    guard.release().await;
                }
                return Err(err);
            }
            Ok(other) => {
                guard.discard().await;
                return Err(DriverError::Connection(format!(
                    "unexpected response to BEGIN: {other:?}"
                )));
            }
            Err(err) => {
                guard.discard().await;
                return Err(err);
            }
        }

        debug!(
            "Began {} on {} ({}, database '{}')",
            id, address, params.access_mode, params.database
        );

        Ok(Self {
            id,
            inner: Arc::new(Mutex::new(TransactionInner {
                id,
                state: TransactionState::Active,
                database: params.database.to_string(),
                access_mode: params.access_mode,
                address,
                queries: Vec::new(),
                connection: Some(guard),
                bookmark: None,
                session: params.session,
                classifier: params.classifier,
                started: Instant::now(),
            })),
        })
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub async fn state(&self) -> TransactionState {
        self.inner.lock().await.state
    }

    pub async fn is_open(&self) -> bool {
        self.state().await.is_active()
    }

    /// Server the transaction is bound to.
    pub async fn server(&self) -> ServerAddress {
        self.inner.lock().await.address.clone()
    }

    pub async fn access_mode(&self) -> AccessMode {
        self.inner.lock().await.access_mode
    }

    /// Queries issued on this transaction, in order.
    pub async fn issued_queries(&self) -> Vec<Query> {
        self.inner.lock().await.queries.clone()
    }

    /// Bookmark produced by the commit, once the transaction has committed.
    pub async fn bookmark(&self) -> Option<Bookmark> {
        self.inner.lock().await.bookmark.clone()
    }

    /// Time since `BEGIN` was acknowledged.
    pub async fn duration(&self) -> Duration {
        self.inner.lock().await.started.elapsed()
    }

    /// Run a query inside the transaction.
    ///
    /// A server-side failure or a lost connection ends the transaction in
    /// the `Failed` state.
    pub async fn run(&self, query: impl Into<Query>) -> Result<QueryResult> {
        let mut inner = self.inner.lock().await;
        inner.ensure_active()?;

        let query = query.into();
        inner.queries.push(query.clone());
        let address = inner.address.clone();

        match inner.send(Request::Run(query)).await {
            Ok(Response::Records(records)) => Ok(QueryResult::new(records, address)),
            Ok(Response::Success { .. }) => Ok(QueryResult::new(Vec::new(), address)),
            Ok(Response::Failure { code, message }) => {
                let err = DriverError::from_server_failure(code, message);
                inner.fail_after_server_error(&err).await;
                Err(err)
            }
            Err(err) => {
                inner.fail_after_connection_loss().await;
                Err(err)
            }
        }
    }

    /// Run a query text with parameters.
    pub async fn run_with(
        &self,
        text: &str,
        params: crate::core::Params,
    ) -> Result<QueryResult> {
        self.run(Query::with_params(text, params)).await
    }

    /// Commit the transaction.
    ///
    /// If the connection drops before the server answers, the outcome is
    /// unknown: the transaction ends `Failed` and the error says so.
    pub async fn commit(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.ensure_active()?;

        match inner.send(Request::Commit).await {
            Ok(Response::Success { bookmark }) => {
                let produced = Bookmark::new(inner.database.clone(), bookmark);
                inner.state.finish(TransactionState::Committed);
                inner.bookmark = Some(produced.clone());
                inner.release_connection().await;
                debug!("Committed {} ({} queries)", inner.id, inner.queries.len());
                merge_into(&inner.session, &produced)
            }
            Ok(Response::Failure { code, message }) => {
                let err = DriverError::from_server_failure(code, message);
                inner.fail_after_server_error(&err).await;
                Err(err)
            }
            Ok(other) => {
                inner.fail_after_connection_loss().await;
                Err(DriverError::IndeterminateCommit(format!(
                    "unexpected response to COMMIT: {other:?}"
                )))
            }
            Err(err) => {
                inner.fail_after_connection_loss().await;
                Err(DriverError::IndeterminateCommit(err.to_string()))
            }
        }
    }

    /// Roll the transaction back.
    ///
    /// Rolling back a transaction that already ended in `RolledBack` or
    /// `Failed` is a no-op. A network failure during rollback is reported as
    /// a connection error; the transaction is rolled back either way.
    pub async fn rollback(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            TransactionState::Active => inner.rollback_active().await,
            TransactionState::Committed => Err(DriverError::TransactionClosed {
                state: inner.state.to_string(),
            }),
            TransactionState::RolledBack | TransactionState::Failed => Ok(()),
        }
    }

    /// Abandon the transaction without talking to the server.
    ///
    /// The connection is discarded as unhealthy. Used when an attempt is
    /// cancelled or its outcome is suspect.
    pub(crate) async fn discard(&self) {
        let mut inner = self.inner.lock().await;
        inner.state.finish(TransactionState::Failed);
        if let Some(guard) = inner.connection.take() {
            guard.discard().await;
        }
    }

    /// Ends an active transaction without waiting on the server.
    ///
    /// The connection is abandoned and the server rolls the transaction
    /// back when it goes away. Returns `false` if another operation holds
    /// the transaction right now.
    pub(crate) fn abandon(&self) -> bool {
        let Ok(mut inner) = self.inner.try_lock() else {
            return false;
        };
        if inner.state.finish(TransactionState::RolledBack) {
            if let Some(guard) = inner.connection.take() {
                guard.abandon();
            }
        }
        true
    }

    pub(crate) fn downgrade(&self) -> Weak<Mutex<TransactionInner>> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn from_weak(id: TransactionId, weak: &Weak<Mutex<TransactionInner>>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { id, inner })
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction").field("id", &self.id).finish()
    }
}

impl TransactionInner {
    fn ensure_active(&self) -> Result<()> {
        if self.state.is_active() {
            Ok(())
        } else {
            Err(DriverError::TransactionClosed {
                state: self.state.to_string(),
            })
        }
    }

    async fn send(&mut self, request: Request) -> Result<Response> {
        match self.connection.as_mut() {
            Some(guard) => guard.connection().send(request).await,
            None => Err(DriverError::Connection(format!(
                "{} has no connection",
                self.id
            ))),
        }
    }

    async fn release_connection(&mut self) {
        if let Some(guard) = self.connection.take() {
            guard.release().await;
        }
    }

    async fn discard_connection(&mut self) {
        if let Some(guard) = self.connection.take() {
            guard.discard().await;
        }
    }

    async fn fail_after_connection_loss(&mut self) {
        self.state.finish(TransactionState::Failed);
        self.discard_connection().await;
    }

    /// The server rejected a request; the transaction is dead server-side.
    ///
    /// Failures the classifier would retry discard the connection. Otherwise
    /// a best-effort rollback resets it before it goes back to the pool.
    async fn fail_after_server_error(&mut self, err: &DriverError) {
        debug!("{} failed on {}: {}", self.id, self.address, err);
        self.state.finish(TransactionState::Failed);
        if is_retryable(self.classifier.as_deref(), err) {
            self.discard_connection().await;
            return;
        }
        match self.send(Request::Rollback).await {
            Ok(_) => self.release_connection().await,
            Err(_) => self.discard_connection().await,
        }
    }

    async fn rollback_active(&mut self) -> Result<()> {
        self.state.finish(TransactionState::RolledBack);
        match self.send(Request::Rollback).await {
            Ok(Response::Failure { code, message }) => {
                warn!(
                    "Server rejected rollback of {} [{}]: {}",
                    self.id, code, message
                );
                self.release_connection().await;
                Ok(())
            }
            Ok(_) => {
                self.release_connection().await;
                debug!("Rolled back {}", self.id);
                Ok(())
            }
            Err(err) => {
                self.discard_connection().await;
                Err(DriverError::Connection(format!(
                    "connection lost during rollback of {}: {}",
                    self.id, err
                )))
            }
        }
    }
}

fn is_retryable(classifier: Option<&dyn RetryClassifier>, err: &DriverError) -> bool {
    classifier.is_some_and(|classifier| classifier.is_retryable(err))
}

impl Drop for TransactionInner {
    fn drop(&mut self) {
        if self.state.is_active() {
            warn!(
                "{} dropped while still active; its connection to {} is discarded",
                self.id, self.address
            );
        }
    }
}
