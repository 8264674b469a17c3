//! Bounded, health-aware connection pooling.
//!
//! One [`ConnectionPool`] exists per backend server. Capacity is enforced
//! with a FIFO-fair semaphore: a permit is held exactly while a connection
//! is in use, so `in_use + idle <= max_connections` holds at all times.
//! Idle connections carry no permit; they are dropped eagerly when a resize
//! lowers the bound.
//!
//! Shrinking never breaks in-use connections. Permits that cannot be
//! reclaimed immediately become *shrink debt*, repaid as busy connections
//! are released.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use sqlgate_error::{PoolErrorKind, Result, SqlGateError};
use tokio::sync::{Notify, Semaphore};
use tokio::time::Instant;

use crate::connector::{BackendConnection, BackendConnector};
use crate::server::{BackendServer, ServerRegistry};

/// Consecutive probe failures before a backend is marked unhealthy.
const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Health {
    Healthy,
    Unhealthy,
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStats {
    /// Connections currently handed out.
    pub in_use: u32,
    /// Idle connections parked in the pool.
    pub idle: u32,
    /// Acquires currently waiting for a permit.
    pub waiters: u32,
    /// Current capacity bound.
    pub max_connections: u32,
    /// Whether the backend is considered healthy.
    pub healthy: bool,
    /// Connection errors observed (failed connects and broken releases).
    pub errors: u64,
    /// When the last error was observed.
    pub last_error_at: Option<DateTime<Utc>>,
}

struct PoolState {
    idle:                 VecDeque<Box<dyn BackendConnection>>,
    in_use:               u32,
    max:                  u32,
    shrink_debt:          u32,
    waiters:              u32,
    draining:             bool,
    health:               Health,
    consecutive_failures: u32,
    errors:               u64,
    last_error_at:        Option<DateTime<Utc>>,
}

/// Bounded FIFO connection pool for one backend server.
pub struct ConnectionPool {
    server:            Arc<BackendServer>,
    connector:         Arc<dyn BackendConnector>,
    sem:               Arc<Semaphore>,
    state:             Mutex<PoolState>,
    drained:           Notify,
    failure_threshold: u32,
}

impl ConnectionPool {
    /// Create a pool sized from the server configuration.
    #[must_use]
    pub fn new(server: Arc<BackendServer>, connector: Arc<dyn BackendConnector>) -> Self {
        let max = server.max_connections;
        Self {
            server,
            connector,
            sem: Arc::new(Semaphore::new(max as usize)),
            state: Mutex::new(PoolState {
                idle:                 VecDeque::new(),
                in_use:               0,
                max,
                shrink_debt:          0,
                waiters:              0,
                draining:             false,
                health:               Health::Healthy,
                consecutive_failures: 0,
                errors:               0,
                last_error_at:        None,
            }),
            drained: Notify::new(),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
        }
    }

    /// Alias of the backend this pool serves.
    #[must_use]
    pub fn alias(&self) -> &str {
        &self.server.alias
    }

    /// Acquire a connection, waiting up to `timeout` in FIFO order.
    ///
    /// # Errors
    ///
    /// - `Pool(Timeout)` when the wait deadline expires.
    /// - `Pool(Unhealthy)` fail-fast while the backend is unhealthy.
    /// - `Pool(Drained)` once [`ConnectionPool::drain`] has started.
    /// - `Backend` when establishing a fresh connection fails.
    pub async fn acquire(self: &Arc<Self>, timeout: Duration) -> Result<PooledConn> {
        {
            let mut st = self.state.lock();
            if st.draining {
                return Err(SqlGateError::pool(&self.server.alias, PoolErrorKind::Drained));
            }
            if st.health == Health::Unhealthy {
                return Err(SqlGateError::pool(&self.server.alias, PoolErrorKind::Unhealthy));
            }
            st.waiters += 1;
        }

        let acquired = tokio::time::timeout(timeout, Arc::clone(&self.sem).acquire_owned()).await;
        self.state.lock().waiters -= 1;

        let permit = match acquired {
            Ok(Ok(permit)) => permit,
            // Semaphore closed by drain.
            Ok(Err(_)) => {
                return Err(SqlGateError::pool(&self.server.alias, PoolErrorKind::Drained));
            },
            Err(_) => {
                return Err(SqlGateError::pool(&self.server.alias, PoolErrorKind::Timeout));
            },
        };

        let reused = {
            let mut st = self.state.lock();
            if st.draining {
                return Err(SqlGateError::pool(&self.server.alias, PoolErrorKind::Drained));
            }
            if st.health == Health::Unhealthy {
                return Err(SqlGateError::pool(&self.server.alias, PoolErrorKind::Unhealthy));
            }
            st.in_use += 1;
            st.idle.pop_front()
        };

        let conn = match reused {
            Some(conn) => conn,
            None => match self.connector.connect(&self.server).await {
                Ok(conn) => conn,
                Err(e) => {
                    let mut st = self.state.lock();
                    st.in_use -= 1;
                    st.errors += 1;
                    st.last_error_at = Some(Utc::now());
                    return Err(e);
                },
            },
        };

        Ok(PooledConn {
            conn:   Some(conn),
            permit: Some(permit),
            pool:   Arc::clone(self),
        })
    }

    /// Atomically move the capacity bound to `new_max`.
    ///
    /// Growing adds capacity immediately. Shrinking drops surplus idle
    /// connections, reclaims whatever free capacity exists right now, and
    /// turns the remainder into debt repaid as busy connections release.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a zero bound.
    pub fn resize(&self, new_max: u32) -> Result<()> {
        if new_max < 1 {
            return Err(SqlGateError::validation("pool size must be at least 1"));
        }

        let shrink_by = {
            let mut st = self.state.lock();
            if new_max == st.max {
                return Ok(());
            }
            let old = st.max;
            if new_max > st.max {
                let grow = new_max - st.max;
                let cancelled = grow.min(st.shrink_debt);
                st.shrink_debt -= cancelled;
                st.max = new_max;
                self.sem.add_permits((grow - cancelled) as usize);
                tracing::info!(alias = %self.server.alias, old, new = new_max, "pool grown");
                0
            } else {
                let shrink = st.max - new_max;
                st.max = new_max;
                while st.idle.len() as u32 + st.in_use > new_max && st.idle.pop_back().is_some() {}
                tracing::info!(alias = %self.server.alias, old, new = new_max, "pool shrinking");
                shrink
            }
        };

        if shrink_by > 0 {
            let mut reclaimed = 0;
            while reclaimed < shrink_by {
                match self.sem.try_acquire() {
                    Ok(permit) => {
                        permit.forget();
                        reclaimed += 1;
                    },
                    Err(_) => break,
                }
            }
            let outstanding = shrink_by - reclaimed;
            if outstanding > 0 {
                self.state.lock().shrink_debt += outstanding;
            }
        }
        Ok(())
    }

    /// Stop accepting acquires, close idle connections, and wait up to
    /// `grace` for in-use connections to come back before force-closing.
    pub async fn drain(&self, grace: Duration) {
        {
            let mut st = self.state.lock();
            if st.draining {
                return;
            }
            st.draining = true;
            st.idle.clear();
        }
        self.sem.close();
        tracing::info!(alias = %self.server.alias, "pool draining");

        let deadline = Instant::now() + grace;
        loop {
            if self.state.lock().in_use == 0 {
                return;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero()
                || tokio::time::timeout(remaining, self.drained.notified())
                    .await
                    .is_err()
            {
                let in_use = self.state.lock().in_use;
                tracing::warn!(alias = %self.server.alias, in_use, "drain grace expired; force closing");
                return;
            }
        }
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let st = self.state.lock();
        PoolStats {
            in_use:          st.in_use,
            idle:            st.idle.len() as u32,
            waiters:         st.waiters,
            max_connections: st.max,
            healthy:         st.health == Health::Healthy,
            errors:          st.errors,
            last_error_at:   st.last_error_at,
        }
    }

    /// Probe backend reachability with a short-lived connection and record
    /// the result. Returns whether the pool is healthy afterwards.
    pub async fn probe(&self) -> bool {
        let outcome = match self.connector.connect(&self.server).await {
            Ok(mut conn) => conn.ping().await.is_ok(),
            Err(_) => false,
        };
        self.record_probe(outcome);
        self.state.lock().health == Health::Healthy
    }

    fn record_probe(&self, success: bool) {
        let mut st = self.state.lock();
        if success {
            if st.health == Health::Unhealthy {
                tracing::info!(alias = %self.server.alias, "backend healthy again");
            }
            st.consecutive_failures = 0;
            st.health = Health::Healthy;
        } else {
            st.consecutive_failures += 1;
            if st.consecutive_failures >= self.failure_threshold && st.health == Health::Healthy {
                tracing::warn!(
                    alias = %self.server.alias,
                    failures = st.consecutive_failures,
                    "backend marked unhealthy"
                );
                st.health = Health::Unhealthy;
            }
        }
    }

    fn release_inner(
        &self,
        conn: Box<dyn BackendConnection>,
        permit: tokio::sync::OwnedSemaphorePermit,
        ok: bool,
    ) {
        let mut st = self.state.lock();
        st.in_use -= 1;
        if !ok {
            st.errors += 1;
            st.last_error_at = Some(Utc::now());
        }

        if st.shrink_debt > 0 {
            st.shrink_debt -= 1;
            permit.forget();
        } else {
            if ok
                && !st.draining
                && st.health == Health::Healthy
                && st.idle.len() as u32 + st.in_use < st.max
            {
                st.idle.push_back(conn);
            }
            drop(permit);
        }

        if st.draining && st.in_use == 0 {
            self.drained.notify_waiters();
        }
    }
}

/// A connection checked out of a [`ConnectionPool`].
///
/// Dropping the guard returns the connection as healthy; call
/// [`PooledConn::release`] with `ok = false` to destroy a connection after
/// a failure so the pool replenishes lazily.
pub struct PooledConn {
    conn:   Option<Box<dyn BackendConnection>>,
    permit: Option<tokio::sync::OwnedSemaphorePermit>,
    pool:   Arc<ConnectionPool>,
}

impl std::fmt::Debug for PooledConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConn")
            .field("conn", &self.conn.as_ref().map(|_| "<connection>"))
            .field("permit", &self.permit.as_ref().map(|_| "<permit>"))
            .finish_non_exhaustive()
    }
}

impl PooledConn {
    /// Access the underlying connection.
    pub fn connection(&mut self) -> &mut dyn BackendConnection {
        self.conn
            .as_mut()
            .expect("connection present until release")
            .as_mut()
    }

    /// Return the connection to the pool, destroying it when `ok` is false.
    pub fn release(mut self, ok: bool) {
        self.finish(ok);
    }

    fn finish(&mut self, ok: bool) {
        if let (Some(conn), Some(permit)) = (self.conn.take(), self.permit.take()) {
            self.pool.release_inner(conn, permit, ok);
        }
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        self.finish(true);
    }
}

/// Creates pools on first use and shares them per backend alias.
pub struct PoolManager {
    registry:  Arc<ServerRegistry>,
    connector: Arc<dyn BackendConnector>,
    pools:     DashMap<String, Arc<ConnectionPool>>,
}

impl PoolManager {
    /// Create a manager over a registry and connector.
    #[must_use]
    pub fn new(registry: Arc<ServerRegistry>, connector: Arc<dyn BackendConnector>) -> Self {
        Self {
            registry,
            connector,
            pools: DashMap::new(),
        }
    }

    /// The registry backing this manager.
    #[must_use]
    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    /// Pool for an alias, created on first use.
    ///
    /// # Errors
    ///
    /// Returns a routing error for unknown or inactive servers.
    pub fn pool_for(&self, alias: &str) -> Result<Arc<ConnectionPool>> {
        if let Some(pool) = self.pools.get(alias) {
            return Ok(Arc::clone(pool.value()));
        }
        let server = self
            .registry
            .get(alias)
            .ok_or_else(|| SqlGateError::routing(format!("unknown server alias '{alias}'")))?;
        if !server.is_active {
            return Err(SqlGateError::routing(format!("server '{alias}' is not active")));
        }
        let pool = self
            .pools
            .entry(alias.to_string())
            .or_insert_with(|| Arc::new(ConnectionPool::new(server, Arc::clone(&self.connector))));
        Ok(Arc::clone(pool.value()))
    }

    /// All pools created so far.
    #[must_use]
    pub fn existing(&self) -> Vec<Arc<ConnectionPool>> {
        self.pools.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Resize a live pool and record the bound in the registry.
    ///
    /// # Errors
    ///
    /// Propagates validation and lookup failures.
    pub fn resize(&self, alias: &str, new_max: u32) -> Result<()> {
        if let Some(pool) = self.pools.get(alias) {
            pool.resize(new_max)?;
        }
        self.registry.set_max_connections(alias, new_max)
    }

    /// Deactivate a server and drain its pool.
    ///
    /// # Errors
    ///
    /// Returns a routing error for an unknown alias.
    pub async fn deactivate(&self, alias: &str, grace: Duration) -> Result<()> {
        self.registry.deactivate(alias)?;
        if let Some(pool) = self.pools.get(alias).map(|p| Arc::clone(p.value())) {
            pool.drain(grace).await;
        }
        Ok(())
    }
}
