// ============================================================================
// Transaction Module
// ============================================================================
//
// A transaction is a sequence of queries on one leased connection, opened
// with the caller's bookmark and closed by commit, rollback or failure. A
// successful commit yields the bookmark that later transactions pass along
// to observe its effects.
//
// ============================================================================

pub mod handle;
pub mod state;

pub use handle::{Transaction, TransactionConfig};
pub use state::{TransactionId, TransactionState};
