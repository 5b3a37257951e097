// ============================================================================
// Transaction Functions
// ============================================================================
//
// The runner executes a caller-supplied unit of work inside a transaction and
// repeats it on a fresh server and connection when the failure is one the
// classifier deems retryable:
//
//   route ──> acquire ──> BEGIN ──> work(tx) ──> COMMIT ──> outcome
//     ^                                │
//     └──── backoff <── retryable ─────┘ non-retryable ──> error
//
// Each attempt is independent. A retryable failure discards the attempt's
// connection; the next attempt starts again from routing. The loop stops on
// success, on a non-retryable error, or when the retry budget runs out.
//
// ============================================================================

pub mod classifier;
pub mod policy;

pub use classifier::{DefaultRetryClassifier, RetryClassifier};
pub use policy::RetryPolicy;

use crate::bookmark::Bookmark;
use crate::connection::pool::ConnectionPool;
use crate::core::{AccessMode, DriverError, Result, ServerAddress};
use crate::routing::{self, Router};
use crate::transaction::handle::BeginParams;
use crate::transaction::{Transaction, TransactionConfig, TransactionState};
use log::debug;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{Instrument, Level, event, info_span};

/// Result of a successful transaction function.
#[derive(Debug, Clone)]
pub struct RunOutcome<T> {
    /// Value returned by the work function
    pub value: T,
    /// The caller's bookmark merged with the one produced by the commit
    pub bookmark: Bookmark,
    /// Attempts made, including the successful one
    pub attempts: usize,
    /// Server the successful attempt ran on
    pub server: ServerAddress,
}

/// What one transaction function call runs against.
#[derive(Debug, Clone, Copy)]
pub struct RunTarget<'a> {
    pub access_mode: AccessMode,
    pub database: &'a str,
    pub bookmark: &'a Bookmark,
    pub config: &'a TransactionConfig,
}

pub struct TransactionRunner {
    pool: ConnectionPool,
    router: Arc<dyn Router>,
    policy: RetryPolicy,
    classifier: Arc<dyn RetryClassifier>,
}

impl TransactionRunner {
    pub fn new(
        pool: ConnectionPool,
        router: Arc<dyn Router>,
        policy: RetryPolicy,
        classifier: Arc<dyn RetryClassifier>,
    ) -> Self {
        Self {
            pool,
            router,
            policy,
            classifier,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `work` in a transaction, retrying retryable failures.
    ///
    /// `work` may be invoked more than once. It must be idempotent, or free
    /// of side effects outside the transaction it is handed. Nothing checks
    /// this.
    ///
    /// If `work` returns `Ok` while its transaction is still open, the
    /// runner commits it. If `work` committed or rolled back on its own,
    /// the runner leaves the transaction alone. When every attempt fails
    /// with a retryable error until the budget runs out, the result is
    /// [`DriverError::RetriesExhausted`] carrying each attempt's cause.
    pub async fn run<F, Fut, T>(&self, target: RunTarget<'_>, mut work: F) -> Result<RunOutcome<T>>
    where
        F: FnMut(Transaction) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let mut causes = Vec::new();
        let mut attempt = 0usize;

        loop {
            attempt += 1;
            let span = info_span!(
                "transaction.attempt",
                attempt = attempt,
                mode = %target.access_mode,
                database = %target.database
            );

            match self.attempt(&target, &mut work).instrument(span).await {
                Ok((value, produced, server)) => {
                    let bookmark = match produced {
                        Some(produced) => target.bookmark.merge(&produced),
                        None => target.bookmark.clone(),
                    };
                    debug!(
                        "Transaction function succeeded on {} after {} attempt(s)",
                        server, attempt
                    );
                    return Ok(RunOutcome {
                        value,
                        bookmark,
                        attempts: attempt,
                        server,
                    });
                }
                Err(err) if !self.classifier.is_retryable(&err) => return Err(err),
                Err(err) => {
                    let elapsed = started.elapsed();
                    if self.policy.is_exhausted(attempt, elapsed) {
                        event!(
                            Level::WARN,
                            attempts = attempt,
                            elapsed_ms = elapsed.as_millis() as u64,
                            error = %err,
                            "transaction retries exhausted"
                        );
                        causes.push(err);
                        return Err(DriverError::RetriesExhausted {
                            attempts: attempt,
                            elapsed,
                            causes,
                        });
                    }

                    let remaining = self.policy.max_retry_time.saturating_sub(elapsed);
                    let delay = self.policy.delay_for(attempt).min(remaining);
                    event!(
                        Level::WARN,
                        attempt = attempt,
                        backoff_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying transaction function"
                    );
                    causes.push(err);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// One attempt, from routing through commit, bounded by the attempt timeout.
    async fn attempt<F, Fut, T>(
        &self,
        target: &RunTarget<'_>,
        work: &mut F,
    ) -> Result<(T, Option<Bookmark>, ServerAddress)>
    where
        F: FnMut(Transaction) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let Some(limit) = self.policy.attempt_timeout else {
            return self.attempt_unbounded(target, work).await;
        };
        match tokio::time::timeout(limit, self.attempt_unbounded(target, work)).await {
            Ok(result) => result,
            // The dropped attempt takes its transaction with it, and a lease
            // dropped without release is discarded by the pool.
            Err(_) => Err(DriverError::Connection(format!(
                "attempt cancelled after exceeding the attempt timeout of {limit:?}"
            ))),
        }
    }

    async fn attempt_unbounded<F, Fut, T>(
        &self,
        target: &RunTarget<'_>,
        work: &mut F,
    ) -> Result<(T, Option<Bookmark>, ServerAddress)>
    where
        F: FnMut(Transaction) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let address = self
            .router
            .route(target.access_mode, target.database)
            .await?;

        let guard = match self.pool.acquire(&address).await {
            Ok(guard) => guard,
            Err(err) => {
                self.report_failure(&address, target.database, &err).await;
                return Err(err);
            }
        };

        let params = BeginParams {
            database: target.database,
            access_mode: target.access_mode,
            bookmark: target.bookmark,
            config: target.config,
            session: Weak::new(),
            classifier: Some(Arc::clone(&self.classifier)),
        };
        let tx = match Transaction::begin(guard, params).await {
            Ok(tx) => tx,
            Err(err) => {
                self.report_failure(&address, target.database, &err).await;
                return Err(err);
            }
        };

        let value = match work(tx.clone()).await {
            Ok(value) => value,
            Err(err) => {
                if self.classifier.is_retryable(&err) {
                    tx.discard().await;
                } else if let Err(rollback_err) = tx.rollback().await {
                    debug!("Rollback after failed work of {} failed: {}", tx.id(), rollback_err);
                }
                self.report_failure(&address, target.database, &err).await;
                return Err(err);
            }
        };

        match tx.state().await {
            TransactionState::Active => {
                if let Err(err) = tx.commit().await {
                    self.report_failure(&address, target.database, &err).await;
                    return Err(err);
                }
            }
            TransactionState::Committed => {}
            TransactionState::RolledBack => return Ok((value, None, address)),
            state @ TransactionState::Failed => {
                return Err(DriverError::TransactionClosed {
                    state: state.to_string(),
                });
            }
        }

        Ok((value, tx.bookmark().await, address))
    }

    async fn report_failure(&self, address: &ServerAddress, database: &str, err: &DriverError) {
        routing::report_failure(self.router.as_ref(), address, database, err).await;
    }
}
