pub mod table;

use crate::core::{AccessMode, DriverError, ErrorKind, Result, ServerAddress};
use async_trait::async_trait;

pub use table::{RoutingTable, StaticRouter};

/// Picks the server that should run a unit of work.
///
/// Topology discovery lives behind this trait. Answers only need to be
/// eventually consistent with the cluster: the transaction runner treats
/// [`DriverError::Routing`] as retryable and asks again.
#[async_trait]
pub trait Router: Send + Sync {
    /// Returns a server able to serve `mode` work for `database`.
    async fn route(&self, mode: AccessMode, database: &str) -> Result<ServerAddress>;

    /// Reports that work routed to `address` failed with `error`.
    ///
    /// Lets implementations forget servers that went away or stopped
    /// accepting writes. The default ignores the report.
    async fn on_failure(&self, _address: &ServerAddress, _database: &str, _error: &DriverError) {}
}

/// Forwards connection and routing failures to `router`; other errors say
/// nothing about the server and are not reported.
pub(crate) async fn report_failure(
    router: &dyn Router,
    address: &ServerAddress,
    database: &str,
    error: &DriverError,
) {
    if matches!(error.kind(), ErrorKind::Connection | ErrorKind::Routing) {
        router.on_failure(address, database, error).await;
    }
}
