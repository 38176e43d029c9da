//! Core connection traits.

use std::future::Future;
use std::pin::Pin;
use std::time::Instant;

use crate::config::DialOptions;
use crate::error::TransportResult;
use crate::state::ConnectionState;

/// Boxed, sendable future used by the object-safe trait methods below.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// An established (or establishing) channel to one remote address.
///
/// The resilience layer only inspects health and lifecycle; issuing calls is the
/// business of whoever holds the concrete type.
pub trait Connection: Send + Sync + std::fmt::Debug {
    /// The `host:port` this connection targets.
    fn address(&self) -> &str;

    /// Returns the current health state.
    fn state(&self) -> ConnectionState;

    /// When the connection object was created.
    fn created_at(&self) -> Instant;

    /// Resolves with the next state different from `from`.
    ///
    /// Implementations must not busy-poll; [`StateWatch`](crate::StateWatch) provides a
    /// ready-made notifier.
    fn wait_for_state_change(&self, from: ConnectionState) -> BoxFuture<'_, ConnectionState>;

    /// Asks an `Idle` connection to start connecting. A no-op in every other state.
    fn connect(&self) {}

    /// Closes the connection. Subsequent calls return [`TransportError::Closed`](crate::TransportError::Closed).
    fn close(&self) -> TransportResult<()>;

    /// Returns `true` if the connection may be handed to a caller.
    fn is_healthy(&self) -> bool {
        self.state().is_healthy()
    }
}

/// Creates connections to remote addresses.
///
/// A dial may return as soon as the connection object exists; the caller waits for
/// `Ready` through [`Connection::wait_for_state_change`].
pub trait Dialer: Send + Sync + std::fmt::Debug + 'static {
    /// The connection type this dialer produces.
    type Connection: Connection + 'static;

    /// Dials `address` with the given options.
    fn dial<'a>(
        &'a self,
        address: &'a str,
        options: &'a DialOptions,
    ) -> BoxFuture<'a, TransportResult<Self::Connection>>;
}
