//! Per-address connection manager.
//!
//! The manager caches one connection per address and hands out shared handles to it.
//! Lookups of a healthy entry only take the read lock. A missing or unhealthy entry
//! is replaced by a dial that runs as its own task; the task is registered under the
//! write lock after a second look at the cache, so concurrent callers for the same
//! address join the in-flight dial instead of starting another. Different addresses
//! dial in parallel because the lock is never held across a dial.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::{FutureExt, Shared};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ManagerConfig;
use crate::context::{Context, ContextError};
use crate::error::{Error, Result};
use crate::stats::{ManagerCounters, ManagerStats, incr};
use tether_transport_traits::{BoxFuture, Connection, ConnectionState, Dialer, TransportError};

type DialFuture<C> = Shared<BoxFuture<'static, Result<Arc<C>>>>;

struct Registry<C> {
    conns: HashMap<String, Arc<C>>,
    dialing: HashMap<String, DialFuture<C>>,
}

impl<C> Default for Registry<C> {
    fn default() -> Self {
        Self {
            conns: HashMap::new(),
            dialing: HashMap::new(),
        }
    }
}

struct Inner<D: Dialer> {
    dialer: D,
    config: ManagerConfig,
    registry: RwLock<Registry<D::Connection>>,
    closed: AtomicBool,
    counters: ManagerCounters,
}

/// Keeps one healthy connection per remote address.
///
/// Cheap to clone; clones share the cache.
pub struct ConnectionManager<D: Dialer> {
    inner: Arc<Inner<D>>,
}

impl<D: Dialer> Clone for ConnectionManager<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Dialer> fmt::Debug for ConnectionManager<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("dialer", &self.inner.dialer)
            .field("config", &self.inner.config)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl<D: Dialer> ConnectionManager<D> {
    /// Create a manager that dials through `dialer`.
    pub fn new(dialer: D, config: ManagerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                dialer,
                config,
                registry: RwLock::new(Registry::default()),
                closed: AtomicBool::new(false),
                counters: ManagerCounters::default(),
            }),
        }
    }

    /// The manager's configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// The dialer new connections come from.
    pub fn dialer(&self) -> &D {
        &self.inner.dialer
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// A healthy connection to `address`, dialing a new one if needed.
    ///
    /// Waits until the new connection is `Ready`, the context is done, or
    /// [`ManagerConfig::ready_timeout`] passes. A dial is never cached unless it
    /// succeeded. The dial itself is bounded only by the readiness timeout, so a
    /// caller that gives up early does not cut short the wait of one that joined it.
    pub async fn get_connection(
        &self,
        ctx: &Context,
        address: &str,
    ) -> Result<Arc<D::Connection>> {
        if self.is_closed() {
            return Err(Error::ManagerClosed);
        }
        ctx.check()?;

        {
            let registry = self.inner.registry.read().await;
            if let Some(conn) = registry.conns.get(address)
                && conn.is_healthy()
            {
                return Ok(Arc::clone(conn));
            }
        }

        let started = Instant::now();
        let dial = {
            let mut registry = self.inner.registry.write().await;
            if self.is_closed() {
                return Err(Error::ManagerClosed);
            }
            if let Some(conn) = registry.conns.get(address)
                && conn.is_healthy()
            {
                return Ok(Arc::clone(conn));
            }
            match registry.dialing.get(address) {
                Some(dial) => {
                    debug!(address = %address, "Joining in-flight dial");
                    dial.clone()
                }
                None => {
                    let dial = self.spawn_dial(address);
                    registry
                        .dialing
                        .insert(address.to_string(), dial.clone());
                    dial
                }
            }
        };

        match ctx.run(dial).await {
            Ok(result) => result,
            Err(ContextError::DeadlineExceeded) => Err(Error::Timeout {
                address: address.to_string(),
                waited: started.elapsed(),
                state: ConnectionState::Connecting,
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Close every cached connection and refuse further requests.
    ///
    /// Every connection is closed even if some fail; failures are logged and the last
    /// one is returned. Connections that were already shut down are not an error.
    pub async fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::Release);

        let conns: Vec<_> = {
            let mut registry = self.inner.registry.write().await;
            registry.conns.drain().collect()
        };

        let total = conns.len();
        let mut last_error = None;
        for (address, conn) in conns {
            match conn.close() {
                Ok(()) | Err(TransportError::Closed) => {}
                Err(source) => {
                    warn!(address = %address, error = %source, "Failed to close connection");
                    last_error = Some(Error::Close { address, source });
                }
            }
        }

        info!(connections = total, "Connection manager closed");
        last_error.map_or(Ok(()), Err)
    }

    /// Drop and close the cached connection for `address`.
    ///
    /// Returns `Ok(false)` if nothing was cached.
    pub async fn remove(&self, address: &str) -> Result<bool> {
        let removed = self.inner.registry.write().await.conns.remove(address);
        let Some(conn) = removed else {
            return Ok(false);
        };

        debug!(address = %address, "Removed cached connection");
        match conn.close() {
            Ok(()) | Err(TransportError::Closed) => Ok(true),
            Err(source) => Err(Error::Close {
                address: address.to_string(),
                source,
            }),
        }
    }

    /// Evict and close every cached connection that is no longer healthy.
    ///
    /// Returns how many were evicted. Scans under the read lock and only takes the
    /// write lock when there is something to evict.
    pub async fn health_check(&self) -> usize {
        let suspects: Vec<String> = {
            let registry = self.inner.registry.read().await;
            registry
                .conns
                .iter()
                .filter(|(_, conn)| !conn.is_healthy())
                .map(|(address, _)| address.clone())
                .collect()
        };
        if suspects.is_empty() {
            return 0;
        }

        let evicted: Vec<_> = {
            let mut registry = self.inner.registry.write().await;
            suspects
                .into_iter()
                .filter_map(|address| {
                    let healthy = registry.conns.get(&address)?.is_healthy();
                    if healthy {
                        return None;
                    }
                    registry.conns.remove_entry(&address)
                })
                .collect()
        };

        for (address, conn) in &evicted {
            incr(&self.inner.counters.evictions);
            warn!(address = %address, state = %conn.state(), "Evicting unhealthy connection");
            if let Err(e) = conn.close()
                && e != TransportError::Closed
            {
                warn!(address = %address, error = %e, "Failed to close evicted connection");
            }
        }
        evicted.len()
    }

    /// Counters plus the current cache occupancy.
    pub async fn stats(&self) -> ManagerStats {
        let registry = self.inner.registry.read().await;
        let healthy = registry
            .conns
            .values()
            .filter(|conn| conn.is_healthy())
            .count();
        self.inner.counters.snapshot(registry.conns.len(), healthy)
    }

    /// Number of cached connections, healthy or not.
    pub async fn len(&self) -> usize {
        self.inner.registry.read().await.conns.len()
    }

    /// Returns `true` if nothing is cached.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn spawn_dial(&self, address: &str) -> DialFuture<D::Connection> {
        let inner = Arc::clone(&self.inner);
        let key = address.to_string();
        let task = tokio::spawn(Arc::clone(&inner).dial(key.clone()));

        let joined: BoxFuture<'static, Result<Arc<D::Connection>>> = Box::pin(async move {
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    inner.registry.write().await.dialing.remove(&key);
                    Err(Error::connection(
                        key,
                        TransportError::ConnectionFailed(format!("dial task failed: {e}")),
                    ))
                }
            }
        });
        joined.shared()
    }
}

impl<D: Dialer> Inner<D> {
    /// Dial, wait for readiness, then publish the outcome under the write lock.
    async fn dial(self: Arc<Self>, address: String) -> Result<Arc<D::Connection>> {
        incr(&self.counters.dials);
        let started = Instant::now();
        let result = connect_ready(&self.dialer, &address, &self.config, None).await;

        let mut registry = self.registry.write().await;
        registry.dialing.remove(&address);

        let conn = match result {
            Ok(conn) => Arc::new(conn),
            Err(e) => {
                incr(&self.counters.dial_failures);
                return Err(e);
            }
        };

        if self.closed.load(Ordering::Acquire) {
            drop(registry);
            if let Err(e) = conn.close()
                && e != TransportError::Closed
            {
                warn!(address = %address, error = %e, "Failed to close late connection");
            }
            return Err(Error::ManagerClosed);
        }

        if let Some(stale) = registry.conns.insert(address.clone(), Arc::clone(&conn)) {
            incr(&self.counters.replacements);
            debug!(address = %address, state = %stale.state(), "Replacing stale connection");
            if let Err(e) = stale.close()
                && e != TransportError::Closed
            {
                warn!(address = %address, error = %e, "Failed to close stale connection");
            }
        }

        info!(
            address = %address,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Connection ready"
        );
        Ok(conn)
    }
}

/// Dial `address` and wait until the connection is `Ready`.
///
/// The effective deadline is the earlier of `deadline` and the configured readiness
/// timeout. A connection that fails to become ready is closed before returning.
pub(crate) async fn connect_ready<D: Dialer>(
    dialer: &D,
    address: &str,
    config: &ManagerConfig,
    deadline: Option<Instant>,
) -> Result<D::Connection> {
    let started = Instant::now();
    let deadline = match (deadline, config.ready_timeout.map(|t| started + t)) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };

    info!(address = %address, "Dialing connection");
    let conn = match within(deadline, dialer.dial(address, &config.dial)).await {
        Some(Ok(conn)) => conn,
        Some(Err(source)) => {
            warn!(address = %address, error = %source, "Dial failed");
            return Err(Error::connection(address, source));
        }
        None => {
            warn!(address = %address, "Dial did not complete before the deadline");
            return Err(Error::Timeout {
                address: address.to_string(),
                waited: started.elapsed(),
                state: ConnectionState::Connecting,
            });
        }
    };

    let outcome = within(deadline, wait_until_ready(&conn)).await;
    let err = match outcome {
        Some(Ok(())) => return Ok(conn),
        Some(Err(state)) => Error::connection(
            address,
            TransportError::ConnectionFailed(format!("connection entered {state} before READY")),
        ),
        None => Error::Timeout {
            address: address.to_string(),
            waited: started.elapsed(),
            state: conn.state(),
        },
    };

    warn!(address = %address, error = %err, "Connection did not become ready");
    if let Err(e) = conn.close()
        && e != TransportError::Closed
    {
        debug!(address = %address, error = %e, "Failed to close abandoned connection");
    }
    Err(err)
}

/// Resolves once `conn` is `Ready`; fails with the terminal state otherwise.
async fn wait_until_ready<C: Connection + ?Sized>(
    conn: &C,
) -> std::result::Result<(), ConnectionState> {
    loop {
        let state = conn.state();
        match state {
            ConnectionState::Ready => return Ok(()),
            ConnectionState::Shutdown => return Err(state),
            ConnectionState::Idle => conn.connect(),
            ConnectionState::Connecting | ConnectionState::TransientFailure => {}
        }
        conn.wait_for_state_change(state).await;
    }
}

async fn within<F: std::future::Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut).await.ok(),
        None => Some(fut.await),
    }
}
