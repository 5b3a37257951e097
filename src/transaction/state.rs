// ============================================================================
// Transaction Lifecycle
// ============================================================================
//
// Every transaction starts Active and ends in exactly one terminal state:
//
//   Active ──commit──────────────> Committed
//     │
//     ├──rollback────────────────> RolledBack
//     │
//     └──unrecoverable failure───> Failed
//
// Failed covers both server-side rejections that kill the transaction and
// connection losses, including a commit whose outcome is unknown. Terminal
// states never change again.
//
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static TRANSACTION_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Client-side identifier for a transaction, used in logs and diagnostics.
///
/// Unique within the process; the server never sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(u64);

impl TransactionId {
    pub(crate) fn new() -> Self {
        Self(TRANSACTION_SEQUENCE.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Open and accepting queries
    Active,

    /// Server confirmed the commit
    Committed,

    /// Rolled back by the client, or by the session closing
    RolledBack,

    /// Transaction died; nothing it did may be assumed to have landed
    Failed,
}

impl TransactionState {
    pub fn is_active(self) -> bool {
        self == TransactionState::Active
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    /// Moves an active transaction into the terminal state `outcome`.
    ///
    /// Returns `false` and leaves the state alone if the transaction
    /// already ended or `outcome` is not terminal.
    pub(crate) fn finish(&mut self, outcome: TransactionState) -> bool {
        if self.is_active() && outcome.is_terminal() {
            *self = outcome;
            true
        } else {
            false
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionState::Active => "active",
            TransactionState::Committed => "committed",
            TransactionState::RolledBack => "rolled back",
            TransactionState::Failed => "failed",
        };
        f.write_str(name)
    }
}
