// ============================================================================
// Sessions
// ============================================================================
//
// A session is a causal chain of transactions against one database. It owns
// the bookmark that links each transaction to the ones before it: every
// commit made through the session is merged in, so the next transaction
// begins at least where the last one ended.
//
// A session runs one transaction at a time. Methods take `&mut self`, so a
// session cannot be driven from two places at once; an explicit transaction
// left open blocks the next one with `SessionBusy` until it is committed,
// rolled back or dropped.
//
// ============================================================================

pub mod config;

pub use config::SessionConfig;

use crate::bookmark::{Bookmark, SharedBookmark};
use crate::connection::config::DriverConfig;
use crate::connection::pool::ConnectionPool;
use crate::core::{AccessMode, DriverError, Query, QueryResult, Result};
use crate::retry::{RunTarget, TransactionRunner};
use crate::routing::{self, Router};
use crate::transaction::handle::{BeginParams, TransactionInner};
use crate::transaction::{Transaction, TransactionConfig, TransactionId};
use log::{debug, warn};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use uuid::Uuid;

/// Everything a driver shares with its sessions.
pub(crate) struct DriverContext {
    pub(crate) config: DriverConfig,
    pub(crate) pool: ConnectionPool,
    pub(crate) router: Arc<dyn Router>,
    pub(crate) runner: TransactionRunner,
}

/// Explicit transaction most recently opened by a session.
///
/// Held weakly: once the caller drops every handle, the transaction is gone
/// and no longer blocks the session.
struct ActiveTransaction {
    id: TransactionId,
    handle: Weak<tokio::sync::Mutex<TransactionInner>>,
}

pub struct Session {
    id: Uuid,
    context: Arc<DriverContext>,
    database: String,
    default_access_mode: AccessMode,
    transaction_config: TransactionConfig,
    bookmark: SharedBookmark,
    active: Option<ActiveTransaction>,
    closed: bool,
}

impl Session {
    pub(crate) fn new(context: Arc<DriverContext>, config: SessionConfig) -> Result<Self> {
        let database = config
            .database
            .clone()
            .unwrap_or_else(|| context.config.database.clone());
        if database.trim().is_empty() {
            return Err(DriverError::Configuration(
                "session database must not be empty".to_string(),
            ));
        }

        let bookmark = config.initial_bookmark(&database);
        bookmark.ensure_database(&database)?;

        let id = Uuid::new_v4();
        debug!(
            "Opened session {} on database '{}' ({} bookmark token(s))",
            id,
            database,
            bookmark.len()
        );

        Ok(Self {
            id,
            default_access_mode: config
                .default_access_mode
                .unwrap_or(context.config.default_access_mode),
            transaction_config: config.transaction_config,
            context,
            database,
            bookmark: Arc::new(Mutex::new(bookmark)),
            active: None,
            closed: false,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn default_access_mode(&self) -> AccessMode {
        self.default_access_mode
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Bookmark covering every transaction committed through this session,
    /// plus the bookmark it started with.
    pub fn last_bookmark(&self) -> Bookmark {
        self.bookmark
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// [`Session::last_bookmark`] as plain tokens, for handing to another process.
    pub fn last_bookmark_tokens(&self) -> BTreeSet<String> {
        self.last_bookmark().to_token_set()
    }

    /// Runs a single query in its own transaction and commits it.
    ///
    /// Nothing is retried. On success the commit's bookmark is merged into
    /// the session.
    pub async fn run(&mut self, query: impl Into<Query>, access_mode: AccessMode) -> Result<QueryResult> {
        self.ensure_idle().await?;
        let tx = self
            .open_transaction(access_mode, &self.transaction_config)
            .await?;

        let result = match tx.run(query).await {
            Ok(result) => result,
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    debug!("Rollback of {} failed: {}", tx.id(), rollback_err);
                }
                self.report_failure(&tx, &err).await;
                return Err(err);
            }
        };

        if let Err(err) = tx.commit().await {
            self.report_failure(&tx, &err).await;
            return Err(err);
        }
        Ok(result)
    }

    /// [`Session::run`] in the session's default access mode.
    pub async fn run_default(&mut self, query: impl Into<Query>) -> Result<QueryResult> {
        let mode = self.default_access_mode;
        self.run(query, mode).await
    }

    /// Opens an explicit transaction with the session's transaction config.
    ///
    /// The caller commits or rolls it back. Nothing is retried. Until the
    /// transaction ends, every other operation on the session fails with
    /// [`DriverError::SessionBusy`].
    pub async fn begin_transaction(&mut self, access_mode: AccessMode) -> Result<Transaction> {
        let config = self.transaction_config.clone();
        self.begin_transaction_with_config(access_mode, config).await
    }

    /// [`Session::begin_transaction`] in the session's default access mode.
    pub async fn begin_default_transaction(&mut self) -> Result<Transaction> {
        let mode = self.default_access_mode;
        self.begin_transaction(mode).await
    }

    pub async fn begin_transaction_with_config(
        &mut self,
        access_mode: AccessMode,
        config: TransactionConfig,
    ) -> Result<Transaction> {
        self.ensure_idle().await?;
        let tx = self.open_transaction(access_mode, &config).await?;
        self.active = Some(ActiveTransaction {
            id: tx.id(),
            handle: tx.downgrade(),
        });
        Ok(tx)
    }

    /// Runs `work` as a read transaction function. See [`Session::execute`].
    pub async fn execute_read<F, Fut, T>(&mut self, work: F) -> Result<T>
    where
        F: FnMut(Transaction) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute(AccessMode::Read, work).await
    }

    /// Runs `work` as a write transaction function. See [`Session::execute`].
    pub async fn execute_write<F, Fut, T>(&mut self, work: F) -> Result<T>
    where
        F: FnMut(Transaction) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute(AccessMode::Write, work).await
    }

    /// Runs `work` in a managed transaction, retrying retryable failures.
    ///
    /// `work` may run several times and must be idempotent outside the
    /// transaction it is given. The commit's bookmark is merged into the
    /// session on success.
    pub async fn execute<F, Fut, T>(&mut self, access_mode: AccessMode, work: F) -> Result<T>
    where
        F: FnMut(Transaction) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.ensure_idle().await?;
        let bookmark = self.last_bookmark();
        let target = RunTarget {
            access_mode,
            database: &self.database,
            bookmark: &bookmark,
            config: &self.transaction_config,
        };

        let outcome = self.context.runner.run(target, work).await?;

        let mut current = self.bookmark.lock()?;
        *current = current.merge(&outcome.bookmark);
        Ok(outcome.value)
    }

    /// Rolls back any open transaction and makes the session unusable.
    ///
    /// Closing twice is fine. A rollback failure is logged, not returned.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }

        if let Some(tx) = self.active_transaction() {
            if tx.is_open().await {
                debug!("Rolling back {} on close of session {}", tx.id(), self.id);
                if let Err(err) = tx.rollback().await {
                    warn!("Rollback of {} during session close failed: {}", tx.id(), err);
                }
            }
        }

        self.active = None;
        self.closed = true;
        debug!("Closed session {}", self.id);
        Ok(())
    }

    fn active_transaction(&self) -> Option<Transaction> {
        self.active
            .as_ref()
            .and_then(|active| Transaction::from_weak(active.id, &active.handle))
    }

    async fn ensure_idle(&mut self) -> Result<()> {
        if self.closed {
            return Err(DriverError::SessionClosed);
        }
        if let Some(tx) = self.active_transaction() {
            if tx.is_open().await {
                return Err(DriverError::SessionBusy);
            }
        }
        self.active = None;
        Ok(())
    }

    async fn open_transaction(
        &self,
        access_mode: AccessMode,
        config: &TransactionConfig,
    ) -> Result<Transaction> {
        let router = self.context.router.as_ref();
        let address = router.route(access_mode, &self.database).await?;

        let guard = match self.context.pool.acquire(&address).await {
            Ok(guard) => guard,
            Err(err) => {
                routing::report_failure(router, &address, &self.database, &err).await;
                return Err(err);
            }
        };

        let bookmark = self.last_bookmark();
        let params = BeginParams {
            database: &self.database,
            access_mode,
            bookmark: &bookmark,
            config,
            session: Arc::downgrade(&self.bookmark),
            classifier: None,
        };
        match Transaction::begin(guard, params).await {
            Ok(tx) => Ok(tx),
            Err(err) => {
                routing::report_failure(router, &address, &self.database, &err).await;
                Err(err)
            }
        }
    }

    async fn report_failure(&self, tx: &Transaction, err: &DriverError) {
        let address = tx.server().await;
        routing::report_failure(self.context.router.as_ref(), &address, &self.database, err).await;
    }
}

/// Dropping an unclosed session ends its open transaction, as `close` does,
/// but abandons the connection instead of sending a rollback.
impl Drop for Session {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Some(tx) = self.active_transaction() {
            if tx.abandon() {
                debug!("Session {} dropped; {} rolled back", self.id, tx.id());
            } else {
                warn!(
                    "Session {} dropped while {} was busy; it stays open",
                    self.id,
                    tx.id()
                );
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("database", &self.database)
            .field("closed", &self.closed)
            .finish()
    }
}
