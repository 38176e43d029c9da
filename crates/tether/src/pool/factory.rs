//! Where pooled connections come from.

use std::fmt;
use std::sync::Arc;

use crate::config::ManagerConfig;
use crate::context::Context;
use crate::error::Result;
use crate::manager::{ConnectionManager, connect_ready};
use tether_transport_traits::{BoxFuture, Connection, Dialer};

/// Produces connections for a [`ConnectionPool`](super::ConnectionPool).
pub trait ConnectionFactory: Send + Sync + fmt::Debug + 'static {
    /// The connection type handed out.
    type Connection: Connection + 'static;

    /// The address connections are made to.
    fn address(&self) -> &str;

    /// A new connection, ready for use. Must respect `ctx`.
    fn create<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, Result<Arc<Self::Connection>>>;

    /// Release whatever the factory holds. Called once when the pool closes.
    fn close(&self) -> BoxFuture<'_, Result<()>>;
}

/// Dials a fresh connection for every pool slot.
#[derive(Debug)]
pub struct DialerFactory<D: Dialer> {
    dialer: D,
    address: String,
    config: ManagerConfig,
}

impl<D: Dialer> DialerFactory<D> {
    /// Dial `address` through `dialer` using the dial options and readiness timeout in `config`.
    pub fn new(dialer: D, address: impl Into<String>, config: ManagerConfig) -> Self {
        Self {
            dialer,
            address: address.into(),
            config,
        }
    }
}

impl<D: Dialer> ConnectionFactory for DialerFactory<D> {
    type Connection = D::Connection;

    fn address(&self) -> &str {
        &self.address
    }

    fn create<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, Result<Arc<D::Connection>>> {
        Box::pin(async move {
            let conn =
                connect_ready(&self.dialer, &self.address, &self.config, ctx.deadline()).await?;
            Ok(Arc::new(conn))
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Draws connections for one address from a shared [`ConnectionManager`].
///
/// Closing the pool closes the manager.
#[derive(Debug)]
pub struct ManagerFactory<D: Dialer> {
    manager: ConnectionManager<D>,
    address: String,
}

impl<D: Dialer> ManagerFactory<D> {
    /// Bind `manager` to `address`.
    pub fn new(manager: ConnectionManager<D>, address: impl Into<String>) -> Self {
        Self {
            manager,
            address: address.into(),
        }
    }

    /// The underlying manager.
    pub fn manager(&self) -> &ConnectionManager<D> {
        &self.manager
    }
}

impl<D: Dialer> ConnectionFactory for ManagerFactory<D> {
    type Connection = D::Connection;

    fn address(&self) -> &str {
        &self.address
    }

    fn create<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, Result<Arc<D::Connection>>> {
        Box::pin(self.manager.get_connection(ctx, &self.address))
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.manager.close())
    }
}
