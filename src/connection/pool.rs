use super::{Connection, Connector, config::DriverConfig};
use crate::core::{DriverError, Result, ServerAddress};
use log::{debug, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Connection pool
///
/// Keeps a bounded set of connections per server address. Bookkeeping lives
/// behind one mutex that is never held across an await; connecting and
/// closing happen outside it.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

/// Limits the pool enforces, taken from [`DriverConfig`].
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_connections_per_address: usize,
    pub acquisition_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub max_lifetime: Option<Duration>,
}

impl From<&DriverConfig> for PoolSettings {
    fn from(config: &DriverConfig) -> Self {
        Self {
            max_connections_per_address: config.max_connection_pool_size,
            acquisition_timeout: config.connection_acquisition_timeout,
            idle_timeout: config.idle_timeout,
            max_lifetime: config.max_connection_lifetime,
        }
    }
}

struct PoolShared {
    settings: PoolSettings,
    connector: Arc<dyn Connector>,
    state: Mutex<PoolState>,
    /// Woken whenever a slot or idle connection may have become available
    released: Notify,
    next_id: AtomicU64,
}

#[derive(Default)]
struct PoolState {
    addresses: HashMap<ServerAddress, AddressPool>,
    closed: bool,
}

#[derive(Default)]
struct AddressPool {
    idle: VecDeque<Connection>,
    in_use: usize,
    created: u64,
    acquisitions: u64,
    discarded: u64,
}

impl AddressPool {
    fn total(&self) -> usize {
        self.idle.len() + self.in_use
    }
}

enum Reservation {
    Idle(Connection),
    Slot,
    Full,
}

impl ConnectionPool {
    pub fn new(settings: PoolSettings, connector: Arc<dyn Connector>) -> Result<Self> {
        if settings.max_connections_per_address == 0 {
            return Err(DriverError::Configuration(
                "max_connections_per_address must be > 0".to_string(),
            ));
        }

        Ok(Self {
            shared: Arc::new(PoolShared {
                settings,
                connector,
                state: Mutex::new(PoolState::default()),
                released: Notify::new(),
                next_id: AtomicU64::new(1),
            }),
        })
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.shared.settings
    }

    /// Lease a connection to `address`, waiting up to the configured acquisition timeout.
    pub async fn acquire(&self, address: &ServerAddress) -> Result<PoolGuard> {
        self.acquire_with_timeout(address, self.shared.settings.acquisition_timeout)
            .await
    }

    /// Lease a connection to `address`, waiting at most `timeout` for a free slot.
    pub async fn acquire_with_timeout(
        &self,
        address: &ServerAddress,
        timeout: Duration,
    ) -> Result<PoolGuard> {
        let deadline = Instant::now() + timeout;

        loop {
            // Register interest before checking so a release in between is not missed
            let notified = self.shared.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // Whatever was reserved is owned by a guard or claim before the
            // first await, so cancelling this future cannot leak a slot.
            let (reservation, stale) = self.shared.reserve(address)?;
            match reservation {
                Reservation::Idle(mut connection) => {
                    connection.refresh_last_used();
                    let guard = self.guard(connection);
                    close_all(stale).await;
                    return Ok(guard);
                }
                Reservation::Slot => {
                    let claim = SlotClaim {
                        shared: &self.shared,
                        address,
                        pending: true,
                    };
                    close_all(stale).await;
                    let connection = self.shared.open(claim).await?;
                    return Ok(self.guard(connection));
                }
                Reservation::Full => close_all(stale).await,
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero()
                || tokio::time::timeout(remaining, notified).await.is_err()
            {
                debug!("Pool timeout waiting for a connection to {}", address);
                return Err(DriverError::PoolTimeout {
                    address: address.clone(),
                    timeout,
                });
            }
        }
    }

    /// Return a connection to the pool. Unhealthy connections are closed instead.
    pub async fn release(&self, guard: PoolGuard) {
        guard.release().await;
    }

    /// Close all idle connections and refuse new leases.
    ///
    /// Connections currently lent out are closed when they come back.
    pub async fn close(&self) {
        let drained: Vec<Connection> = {
            let mut state = self.shared.lock_state();
            state.closed = true;
            state
                .addresses
                .values_mut()
                .flat_map(|pool| pool.idle.drain(..))
                .collect()
        };
        debug!("Closing connection pool ({} idle connections)", drained.len());
        close_all(drained).await;
        self.shared.released.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock_state().closed
    }

    /// Get pool statistics for one address
    pub fn stats(&self, address: &ServerAddress) -> PoolStats {
        let state = self.shared.lock_state();
        let max = self.shared.settings.max_connections_per_address;
        match state.addresses.get(address) {
            Some(pool) => PoolStats {
                address: address.clone(),
                idle_connections: pool.idle.len(),
                in_use_connections: pool.in_use,
                max_connections: max,
                created: pool.created,
                acquisitions: pool.acquisitions,
                discarded: pool.discarded,
            },
            None => PoolStats {
                address: address.clone(),
                idle_connections: 0,
                in_use_connections: 0,
                max_connections: max,
                created: 0,
                acquisitions: 0,
                discarded: 0,
            },
        }
    }

    /// Addresses the pool has seen so far.
    pub fn addresses(&self) -> Vec<ServerAddress> {
        let state = self.shared.lock_state();
        let mut addresses: Vec<_> = state.addresses.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    fn guard(&self, connection: Connection) -> PoolGuard {
        PoolGuard {
            connection: Some(connection),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl PoolShared {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        // Bookkeeping stays consistent even if a holder panicked; every
        // critical section is a handful of counter updates.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Pick an idle connection or claim a slot for a new one.
    ///
    /// Returns connections pruned for age alongside the decision so the
    /// caller can close them without holding the lock.
    fn reserve(&self, address: &ServerAddress) -> Result<(Reservation, Vec<Connection>)> {
        let mut state = self.state.lock()?;
        if state.closed {
            return Err(DriverError::PoolClosed);
        }

        let max = self.settings.max_connections_per_address;
        let pool = state.addresses.entry(address.clone()).or_default();

        let mut stale = Vec::new();
        while let Some(connection) = pool.idle.pop_front() {
            if !connection.is_healthy() {
                pool.discarded += 1;
                stale.push(connection);
                continue;
            }
            if connection.is_expired(self.settings.max_lifetime)
                || connection.is_idle_too_long(self.settings.idle_timeout)
            {
                stale.push(connection);
                continue;
            }
            pool.in_use += 1;
            pool.acquisitions += 1;
            return Ok((Reservation::Idle(connection), stale));
        }

        if pool.total() < max {
            pool.in_use += 1;
            pool.acquisitions += 1;
            Ok((Reservation::Slot, stale))
        } else {
            Ok((Reservation::Full, stale))
        }
    }

    /// Open a connection for a slot claimed by `reserve`.
    ///
    /// The claim hands the slot back if connecting fails or this future is
    /// dropped before the connector answers.
    async fn open(&self, claim: SlotClaim<'_>) -> Result<Connection> {
        let address = claim.address;
        match self.connector.connect(address).await {
            Ok(transport) => {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                {
                    let mut state = self.lock_state();
                    state.addresses.entry(address.clone()).or_default().created += 1;
                }
                claim.fulfil();
                debug!("Opened connection {} to {}", id, address);
                Ok(Connection::new(id, address.clone(), transport))
            }
            Err(err) => {
                drop(claim);
                Err(match err {
                    DriverError::Connection(_) => err,
                    other => DriverError::Connection(format!(
                        "failed to connect to {address}: {other}"
                    )),
                })
            }
        }
    }

    fn give_back_slot(&self, address: &ServerAddress, discarded: bool) {
        {
            let mut state = self.lock_state();
            if let Some(pool) = state.addresses.get_mut(address) {
                pool.in_use = pool.in_use.saturating_sub(1);
                if discarded {
                    pool.discarded += 1;
                }
            }
        }
        self.released.notify_waiters();
    }

    async fn check_in(&self, mut connection: Connection) {
        let address = connection.address().clone();
        let healthy = connection.is_healthy();
        let returned = {
            let mut state = self.lock_state();
            let closed = state.closed;
            let expired = connection.is_expired(self.settings.max_lifetime);
            let pool = state.addresses.entry(address.clone()).or_default();
            pool.in_use = pool.in_use.saturating_sub(1);
            if !healthy {
                pool.discarded += 1;
            }
            if healthy && !closed && !expired {
                connection.refresh_last_used();
                pool.idle.push_back(connection);
                None
            } else {
                Some(connection)
            }
        };

        self.released.notify_waiters();

        if let Some(mut connection) = returned {
            if !healthy {
                debug!(
                    "Discarding unhealthy connection {} to {}",
                    connection.id(),
                    address
                );
            }
            connection.close().await;
        }
    }
}

/// A slot counted as in use while its connection is being opened.
///
/// Dropped unfulfilled, it gives the slot back.
struct SlotClaim<'a> {
    shared: &'a PoolShared,
    address: &'a ServerAddress,
    pending: bool,
}

impl SlotClaim<'_> {
    fn fulfil(mut self) {
        self.pending = false;
    }
}

impl Drop for SlotClaim<'_> {
    fn drop(&mut self) {
        if self.pending {
            debug!("Connect to {} abandoned; slot returned", self.address);
            self.shared.give_back_slot(self.address, false);
        }
    }
}

async fn close_all(connections: Vec<Connection>) {
    for mut connection in connections {
        connection.close().await;
    }
}

/// Connection pool statistics for one address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub address: ServerAddress,
    pub idle_connections: usize,
    pub in_use_connections: usize,
    pub max_connections: usize,
    /// Connections opened so far
    pub created: u64,
    /// Successful leases so far
    pub acquisitions: u64,
    /// Connections dropped because they were unhealthy or abandoned
    pub discarded: u64,
}

impl PoolStats {
    pub fn total_connections(&self) -> usize {
        self.idle_connections + self.in_use_connections
    }
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pool Stats [{}]: {} in use, {} idle, max {}, {} discarded",
            self.address,
            self.in_use_connections,
            self.idle_connections,
            self.max_connections,
            self.discarded
        )
    }
}

/// RAII lease on a pooled connection
///
/// Call [`PoolGuard::release`] to hand a connection back. A guard dropped
/// without being released (a cancelled future, a panic) discards its
/// connection: its state is unknown, so it never returns to the idle set.
pub struct PoolGuard {
    connection: Option<Connection>,
    shared: Arc<PoolShared>,
}

impl PoolGuard {
    /// Get a reference to the connection
    pub fn connection(&mut self) -> &mut Connection {
        self.connection
            .as_mut()
            .expect("Connection already returned to pool")
    }

    pub fn address(&self) -> Option<&ServerAddress> {
        self.connection.as_ref().map(Connection::address)
    }

    pub fn mark_unhealthy(&mut self) {
        if let Some(connection) = self.connection.as_mut() {
            connection.mark_unhealthy();
        }
    }

    /// Return the connection to the pool, closing it if it is unhealthy.
    pub async fn release(mut self) {
        if let Some(connection) = self.connection.take() {
            self.shared.check_in(connection).await;
        }
    }

    /// Free the slot and drop the connection unclosed, for callers that
    /// cannot await.
    pub(crate) fn abandon(mut self) {
        if let Some(connection) = self.connection.take() {
            self.shared.give_back_slot(connection.address(), true);
        }
    }

    /// Close the connection and free its slot without returning it.
    pub async fn discard(mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.mark_unhealthy();
            self.shared.check_in(connection).await;
        }
    }
}

impl std::fmt::Debug for PoolGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolGuard")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            warn!(
                "PoolGuard for connection {} to {} dropped without release; discarding it",
                connection.id(),
                connection.address()
            );
            self.shared.give_back_slot(connection.address(), true);
        }
    }
}
