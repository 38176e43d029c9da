//! Bounded connection pool.
//!
//! The pool caps how many connections exist at once, idle ones included. Idle
//! connections wait in a bounded free-list; `active` counts every connection the pool
//! has created and not yet retired, and is the number admission is checked against.
//!
//! Checkout returns a [`PooledConnection`] guard that gives the connection back on
//! drop, so capacity is released on every exit path. Neither checkout nor return
//! ever waits for capacity: an empty pool at its limit fails with
//! [`Error::ResourceExhausted`], and a return that finds the free-list full closes
//! the connection instead.

mod factory;

pub use factory::{ConnectionFactory, DialerFactory, ManagerFactory};

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::context::{Context, ContextError};
use crate::error::{Error, Result};
use crate::stats::{PoolCounters, PoolStats, incr};
use tether_transport_traits::{Connection, ConnectionState, TransportError};
use tokio::time::Instant;

type Conn<F> = Arc<<F as ConnectionFactory>::Connection>;

#[derive(Debug, Default)]
struct PoolState {
    active: usize,
    closed: bool,
}

struct Inner<F: ConnectionFactory> {
    factory: F,
    size: usize,
    idle_tx: flume::Sender<Conn<F>>,
    idle_rx: flume::Receiver<Conn<F>>,
    state: Mutex<PoolState>,
    counters: PoolCounters,
}

/// A bounded set of reusable connections drawn from a [`ConnectionFactory`].
///
/// Cheap to clone; clones share the same pool.
pub struct ConnectionPool<F: ConnectionFactory> {
    inner: Arc<Inner<F>>,
}

impl<F: ConnectionFactory> Clone for ConnectionPool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ConnectionFactory> fmt::Debug for ConnectionPool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("factory", &self.inner.factory)
            .field("size", &self.inner.size)
            .field("state", &*self.inner.state.lock())
            .finish_non_exhaustive()
    }
}

enum Returned<C> {
    Pooled,
    Closed(C),
    Unhealthy(C),
    Overflow(C),
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    /// Create a pool of `config.size` connections over `factory`.
    pub fn new(factory: F, config: PoolConfig) -> Result<Self> {
        config.validate()?;
        let (idle_tx, idle_rx) = flume::bounded(config.size);
        Ok(Self {
            inner: Arc::new(Inner {
                factory,
                size: config.size,
                idle_tx,
                idle_rx,
                state: Mutex::new(PoolState::default()),
                counters: PoolCounters::default(),
            }),
        })
    }

    /// The configured capacity.
    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// The factory connections come from.
    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Check out a connection: an idle healthy one if available, else a new one.
    ///
    /// Only the factory call can wait, and it is bounded by `ctx`.
    pub async fn get(&self, ctx: &Context) -> Result<PooledConnection<F>> {
        if self.is_closed() {
            return Err(Error::PoolClosed);
        }
        ctx.check()?;

        if let Ok(conn) = self.inner.idle_rx.try_recv() {
            if conn.is_healthy() {
                incr(&self.inner.counters.reused);
                return Ok(self.guard(conn));
            }
            debug!(address = %conn.address(), state = %conn.state(), "Discarding unhealthy idle connection");
            self.retire(&conn);
        }

        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(Error::PoolClosed);
            }
            if state.active >= self.inner.size {
                incr(&self.inner.counters.exhausted);
                debug!(pool_size = self.inner.size, "Connection pool exhausted");
                return Err(Error::ResourceExhausted {
                    pool_size: self.inner.size,
                });
            }
            state.active += 1;
        }

        let started = Instant::now();
        let created = match ctx.run(self.inner.factory.create(ctx)).await {
            Ok(result) => result,
            Err(ContextError::DeadlineExceeded) => Err(Error::Timeout {
                address: self.inner.factory.address().to_string(),
                waited: started.elapsed(),
                state: ConnectionState::Connecting,
            }),
            Err(err) => Err(err.into()),
        };
        let conn = match created {
            Ok(conn) => conn,
            Err(e) => {
                self.release_slot();
                return Err(e);
            }
        };

        if self.is_closed() {
            // Capacity was already zeroed by close
            close_quietly(&conn);
            return Err(Error::PoolClosed);
        }

        incr(&self.inner.counters.created);
        debug!(address = %conn.address(), "Created pooled connection");
        Ok(self.guard(conn))
    }

    /// Return a connection that was [detached](PooledConnection::detach) from its guard.
    ///
    /// Never blocks. The connection is closed instead of pooled when the pool is
    /// closed, when it is unhealthy, or when the free-list has no room.
    pub fn put(&self, conn: Conn<F>) {
        let returned = {
            let state = self.inner.state.lock();
            if state.closed {
                Returned::Closed(conn)
            } else if !conn.is_healthy() {
                Returned::Unhealthy(conn)
            } else {
                match self.inner.idle_tx.try_send(conn) {
                    Ok(()) => Returned::Pooled,
                    Err(e) => Returned::Overflow(e.into_inner()),
                }
            }
        };

        match returned {
            Returned::Pooled => {}
            Returned::Closed(conn) => close_quietly(&conn),
            Returned::Unhealthy(conn) => {
                debug!(address = %conn.address(), state = %conn.state(), "Retiring unhealthy connection");
                self.retire(&conn);
            }
            // Every counted connection fits the free-list, so an overflow was never counted
            Returned::Overflow(conn) => {
                debug!(address = %conn.address(), "Free-list full, closing returned connection");
                incr(&self.inner.counters.discarded);
                close_quietly(&conn);
            }
        }
    }

    /// Close the pool: refuse new checkouts, close idle connections, then close the factory.
    ///
    /// Checked-out connections are closed when they come back. Idempotent.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.active = 0;
        }

        let idle: Vec<_> = self.inner.idle_rx.drain().collect();
        for conn in &idle {
            close_quietly(conn);
        }
        info!(idle = idle.len(), "Connection pool closed");

        self.inner.factory.close().await
    }

    /// Current occupancy and cumulative counters.
    pub fn stats(&self) -> PoolStats {
        let (active, closed) = {
            let state = self.inner.state.lock();
            (state.active, state.closed)
        };
        self.inner
            .counters
            .snapshot(self.inner.size, active, self.inner.idle_rx.len(), closed)
    }

    fn guard(&self, conn: Conn<F>) -> PooledConnection<F> {
        PooledConnection {
            conn,
            pool: self.clone(),
            released: false,
        }
    }

    /// Close `conn` and give its slot back.
    fn retire(&self, conn: &Conn<F>) {
        incr(&self.inner.counters.discarded);
        close_quietly(conn);
        self.release_slot();
    }

    fn release_slot(&self) {
        let mut state = self.inner.state.lock();
        if !state.closed {
            state.active = state.active.saturating_sub(1);
        }
    }
}

fn close_quietly<C: Connection + ?Sized>(conn: &Arc<C>) {
    if let Err(e) = conn.close()
        && e != TransportError::Closed
    {
        warn!(address = %conn.address(), error = %e, "Failed to close connection");
    }
}

/// A checked-out connection. Returned to its pool on drop.
pub struct PooledConnection<F: ConnectionFactory> {
    conn: Conn<F>,
    pool: ConnectionPool<F>,
    released: bool,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    /// The shared connection handle.
    pub fn connection(&self) -> &Conn<F> {
        &self.conn
    }

    /// Take the connection out of the guard. The caller must hand it back with
    /// [`ConnectionPool::put`] or the slot stays occupied.
    pub fn detach(mut self) -> Conn<F> {
        self.released = true;
        Arc::clone(&self.conn)
    }

    /// Close the connection instead of returning it, freeing its slot.
    pub fn discard(mut self) -> Result<()> {
        self.released = true;
        incr(&self.pool.inner.counters.discarded);
        let result = self.conn.close();
        self.pool.release_slot();
        match result {
            Ok(()) | Err(TransportError::Closed) => Ok(()),
            Err(source) => Err(Error::Close {
                address: self.conn.address().to_string(),
                source,
            }),
        }
    }
}

impl<F: ConnectionFactory> Deref for PooledConnection<F> {
    type Target = F::Connection;

    fn deref(&self) -> &F::Connection {
        &self.conn
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.pool.put(Arc::clone(&self.conn));
        }
    }
}

impl<F: ConnectionFactory> fmt::Debug for PooledConnection<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ErrorCategory;
    use crate::config::{ManagerConfig, RetryConfig};
    use crate::manager::ConnectionManager;
    use crate::retry::{RetryError, Retryer};
    use crate::test_support::{Behavior, MockConnection, MockDialer};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::time::Duration;

    const ADDR: &str = "10.0.0.2:50051";

    type TestPool = ConnectionPool<DialerFactory<MockDialer>>;

    fn pool(dialer: &MockDialer, size: usize) -> TestPool {
        let factory = DialerFactory::new(dialer.clone(), ADDR, ManagerConfig::default());
        ConnectionPool::new(factory, PoolConfig::new(size)).unwrap()
    }

    #[test]
    fn test_zero_size_is_rejected() {
        let factory = DialerFactory::new(MockDialer::ready(), ADDR, ManagerConfig::default());
        let err = ConnectionPool::new(factory, PoolConfig::new(0)).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn test_returned_connection_is_reused() {
        let dialer = MockDialer::ready();
        let pool = pool(&dialer, 2);
        let ctx = Context::background();

        let first = pool.get(&ctx).await.unwrap();
        let handle = Arc::clone(first.connection());
        drop(first);

        let second = pool.get(&ctx).await.unwrap();
        assert!(Arc::ptr_eq(&handle, second.connection()));
        assert_eq!(dialer.dials(), 1);

        let stats = pool.stats();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.reused, 1);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.in_use(), 1);
    }

    #[tokio::test]
    async fn test_exhaustion() {
        let dialer = MockDialer::ready();
        let pool = pool(&dialer, 2);
        let ctx = Context::background();

        let a = pool.get(&ctx).await.unwrap();
        let _b = pool.get(&ctx).await.unwrap();
        let err = pool.get(&ctx).await.unwrap_err();
        assert_eq!(err, Error::ResourceExhausted { pool_size: 2 });
        assert_eq!(pool.stats().exhausted, 1);

        drop(a);
        assert!(pool.get(&ctx).await.is_ok());
        assert_eq!(dialer.dials(), 2);
    }

    #[tokio::test]
    async fn test_factory_failure_releases_slot() {
        let dialer = MockDialer::new(Behavior::Fail(TransportError::ConnectionFailed(
            "refused".to_string(),
        )));
        let pool = pool(&dialer, 1);
        let ctx = Context::background();

        assert!(matches!(
            pool.get(&ctx).await,
            Err(Error::Connection { .. })
        ));
        assert_eq!(pool.stats().active, 0);

        dialer.set_behavior(Behavior::Ready);
        assert!(pool.get(&ctx).await.is_ok());
    }

    #[tokio::test]
    async fn test_unhealthy_on_return_is_closed_and_replaced() {
        let dialer = MockDialer::ready();
        let pool = pool(&dialer, 1);
        let ctx = Context::background();

        let conn = pool.get(&ctx).await.unwrap();
        conn.set_state(ConnectionState::TransientFailure);
        drop(conn);

        let first = &dialer.dialed()[0];
        assert_eq!(first.state(), ConnectionState::Shutdown);
        assert_eq!(pool.stats().active, 0);
        assert_eq!(pool.stats().idle, 0);

        let fresh = pool.get(&ctx).await.unwrap();
        assert_eq!(fresh.state(), ConnectionState::Ready);
        assert_eq!(dialer.dials(), 2);
    }

    #[tokio::test]
    async fn test_unhealthy_idle_connection_is_replaced_on_get() {
        let dialer = MockDialer::ready();
        let pool = pool(&dialer, 1);
        let ctx = Context::background();

        drop(pool.get(&ctx).await.unwrap());
        dialer.dialed()[0].set_state(ConnectionState::TransientFailure);

        let conn = pool.get(&ctx).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Ready);
        assert_eq!(dialer.dials(), 2);
        assert_eq!(dialer.dialed()[0].state(), ConnectionState::Shutdown);
        assert_eq!(pool.stats().discarded, 1);
    }

    #[tokio::test]
    async fn test_close_drains_idle_and_rejects_get() {
        let dialer = MockDialer::ready();
        let pool = pool(&dialer, 2);
        let ctx = Context::background();

        drop(pool.get(&ctx).await.unwrap());
        pool.close().await.unwrap();

        assert_eq!(dialer.dialed()[0].state(), ConnectionState::Shutdown);
        assert_eq!(pool.get(&ctx).await.unwrap_err(), Error::PoolClosed);
        assert_eq!(
            pool.stats(),
            PoolStats {
                pool_size: 2,
                active: 0,
                idle: 0,
                closed: true,
                created: 1,
                reused: 0,
                discarded: 0,
                exhausted: 0,
            }
        );

        pool.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_shuts_down_idle_even_when_close_fails() {
        let dialer = MockDialer::ready();
        let pool = pool(&dialer, 2);
        let ctx = Context::background();

        let a = pool.get(&ctx).await.unwrap();
        let b = pool.get(&ctx).await.unwrap();
        drop((a, b));
        dialer.dialed()[0].fail_close();

        pool.close().await.unwrap();
        for conn in dialer.dialed() {
            assert_eq!(conn.state(), ConnectionState::Shutdown);
        }
        assert_eq!(pool.stats().idle, 0);
    }

    #[tokio::test]
    async fn test_discard_reports_close_failure() {
        let dialer = MockDialer::ready();
        let pool = pool(&dialer, 1);
        let ctx = Context::background();

        let conn = pool.get(&ctx).await.unwrap();
        conn.fail_close();
        let err = conn.discard().unwrap_err();
        assert!(matches!(
            err,
            Error::Close {
                source: TransportError::ConnectionLost(_),
                ..
            }
        ));
        assert_eq!(pool.stats().active, 0);
        assert_eq!(dialer.dialed()[0].state(), ConnectionState::Shutdown);
    }

    #[tokio::test]
    async fn test_put_after_close_closes_without_touching_count() {
        let dialer = MockDialer::ready();
        let pool = pool(&dialer, 2);
        let ctx = Context::background();

        let conn = pool.get(&ctx).await.unwrap().detach();
        pool.close().await.unwrap();
        pool.put(Arc::clone(&conn));

        assert_eq!(conn.state(), ConnectionState::Shutdown);
        assert_eq!(pool.stats().active, 0);
    }

    #[tokio::test]
    async fn test_put_on_full_free_list_closes() {
        let dialer = MockDialer::ready();
        let pool = pool(&dialer, 1);
        let ctx = Context::background();

        drop(pool.get(&ctx).await.unwrap());
        let stray = Arc::new(MockConnection::new(ADDR, ConnectionState::Ready));
        pool.put(Arc::clone(&stray));

        assert_eq!(stray.state(), ConnectionState::Shutdown);
        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.discarded, 1);
    }

    #[tokio::test]
    async fn test_discard_frees_slot() {
        let dialer = MockDialer::ready();
        let pool = pool(&dialer, 1);
        let ctx = Context::background();

        let conn = pool.get(&ctx).await.unwrap();
        conn.discard().unwrap();
        assert_eq!(pool.stats().active, 0);
        assert_eq!(dialer.dialed()[0].closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_respects_context_during_creation() {
        let dialer = MockDialer::new(Behavior::Stuck);
        let pool = pool(&dialer, 1);
        let ctx = Context::with_timeout(Duration::from_millis(100));

        let err = pool.get(&ctx).await.unwrap_err();
        assert_eq!(
            err,
            Error::Timeout {
                address: ADDR.to_string(),
                waited: Duration::from_millis(100),
                state: ConnectionState::Connecting,
            }
        );
        assert_eq!(err.category(), ErrorCategory::Timeout);
        assert_eq!(pool.stats().active, 0);
    }

    #[tokio::test]
    async fn test_get_reports_cancellation_as_context_error() {
        let dialer = MockDialer::new(Behavior::Stuck);
        let pool = pool(&dialer, 1);
        let ctx = Context::background();

        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            canceller.cancel();
        });

        let err = pool.get(&ctx).await.unwrap_err();
        assert_eq!(err, Error::Context(ContextError::Cancelled));
        assert_eq!(pool.stats().active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_attempt_deadline_is_retried() {
        let dialer = MockDialer::new(Behavior::Stuck);
        let pool = pool(&dialer, 1);
        let retryer = Retryer::new(
            RetryConfig::default()
                .with_max_retries(3)
                .with_jitter(None)
                .with_backoff(Duration::from_millis(10), Duration::from_millis(10)),
        );

        let err = retryer
            .retry(|| {
                let pool = pool.clone();
                async move {
                    let attempt =
                        Context::background().child_with_timeout(Duration::from_millis(50));
                    pool.get(&attempt).await.map(|_| ())
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            RetryError::Exhausted {
                attempts: 4,
                last: Error::Timeout { .. }
            }
        ));
        assert_eq!(dialer.dials(), 4);
        assert_eq!(pool.stats().active, 0);
    }

    #[tokio::test]
    async fn test_manager_factory_close_closes_manager() {
        let dialer = MockDialer::ready();
        let manager = ConnectionManager::new(dialer.clone(), ManagerConfig::default());
        let pool = ConnectionPool::new(
            ManagerFactory::new(manager.clone(), ADDR),
            PoolConfig::new(4),
        )
        .unwrap();

        let ctx = Context::background();
        let a = pool.get(&ctx).await.unwrap();
        let b = pool.get(&ctx).await.unwrap();
        // The manager multiplexes one connection per address
        assert!(Arc::ptr_eq(a.connection(), b.connection()));
        assert_eq!(dialer.dials(), 1);

        drop((a, b));
        pool.close().await.unwrap();
        assert!(manager.is_closed());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Get,
        Put,
        Sicken,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![Just(Op::Get), Just(Op::Put), Just(Op::Sicken)]
    }

    proptest! {
        #[test]
        fn prop_active_never_exceeds_size(size in 1usize..5, ops in prop::collection::vec(op(), 1..60)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async {
                let dialer = MockDialer::ready();
                let pool = pool(&dialer, size);
                let ctx = Context::background();
                let mut held = Vec::new();

                for op in ops {
                    match op {
                        Op::Get => {
                            let idle = pool.stats().idle;
                            match pool.get(&ctx).await {
                                Ok(conn) => held.push(conn),
                                Err(Error::ResourceExhausted { .. }) => {
                                    prop_assert_eq!(idle, 0);
                                    prop_assert_eq!(held.len(), size);
                                }
                                Err(other) => prop_assert!(false, "unexpected error {other}"),
                            }
                        }
                        Op::Put => {
                            held.pop();
                        }
                        Op::Sicken => {
                            if let Some(conn) = held.last() {
                                conn.set_state(ConnectionState::TransientFailure);
                            }
                        }
                    }

                    let stats = pool.stats();
                    prop_assert!(stats.active <= size);
                    prop_assert_eq!(stats.active, held.len() + stats.idle);
                }
                Ok(())
            })?;
        }
    }
}
