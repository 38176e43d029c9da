//! TCP dialer and connection.

use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpSocket, TcpStream, lookup_host};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use tether_transport_traits::{
    BoxFuture, Connection, ConnectionState, DialOptions, Dialer, KeepAliveConfig, StateWatch,
    TransportError, TransportResult,
};

/// Dials plain TCP connections.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    /// Disable Nagle's algorithm on new streams
    nodelay: bool,
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self { nodelay: true }
    }
}

impl TcpDialer {
    /// Create a dialer with `TCP_NODELAY` enabled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable `TCP_NODELAY` on dialed streams.
    #[must_use]
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    async fn connect_addr(
        &self,
        addr: SocketAddr,
        keep_alive: Option<&KeepAliveConfig>,
    ) -> io::Result<TcpStream> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_keepalive(keep_alive.is_some())?;
        let stream = socket.connect(addr).await?;
        stream.set_nodelay(self.nodelay)?;
        if let Some(keep_alive) = keep_alive {
            let params = TcpKeepalive::new()
                .with_time(keep_alive.time)
                .with_interval(keep_alive.interval);
            SockRef::from(&stream).set_tcp_keepalive(&params)?;
        }
        Ok(stream)
    }

    /// Resolve `address` and try each resolved socket address in turn.
    async fn establish(&self, address: &str, options: &DialOptions) -> TransportResult<TcpStream> {
        let resolved: Vec<SocketAddr> = lookup_host(address)
            .await
            .map_err(|e| {
                TransportError::ConnectionFailed(format!("failed to resolve {address}: {e}"))
            })?
            .collect();

        let mut last_error = None;
        for addr in resolved {
            match self.connect_addr(addr, options.keep_alive.as_ref()).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!(address = %address, resolved = %addr, error = %e, "TCP connect attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(match last_error {
            Some(e) => {
                TransportError::ConnectionFailed(format!("failed to connect to {address}: {e}"))
            }
            None => TransportError::ConnectionFailed(format!("{address} resolved to no addresses")),
        })
    }
}

impl Dialer for TcpDialer {
    type Connection = TcpConnection;

    fn dial<'a>(
        &'a self,
        address: &'a str,
        options: &'a DialOptions,
    ) -> BoxFuture<'a, TransportResult<TcpConnection>> {
        Box::pin(async move {
            if options.tls.enabled {
                return Err(TransportError::ConfigurationError(
                    "TLS is not terminated by the plain TCP dialer".to_string(),
                ));
            }

            info!(address = %address, "Connecting to TCP endpoint");
            let state = StateWatch::new(ConnectionState::Connecting);

            let stream = tokio::time::timeout(
                options.connect_timeout,
                self.establish(address, options),
            )
            .await
            .map_err(|_| TransportError::ConnectionTimeout {
                address: address.to_string(),
                timeout: options.connect_timeout,
            })??;

            let peer_addr = stream.peer_addr().ok();
            state.set(ConnectionState::Ready);
            debug!(address = %address, peer = ?peer_addr, "TCP connection ready");

            Ok(TcpConnection {
                address: address.to_string(),
                peer_addr,
                stream: Mutex::new(Some(stream)),
                state,
                created_at: Instant::now(),
            })
        })
    }
}

/// A dialed TCP stream with health tracking.
///
/// The stream is only reachable through [`TcpConnection::with_stream`], which marks the
/// connection as `TransientFailure` when the caller's I/O fails.
#[derive(Debug)]
pub struct TcpConnection {
    address: String,
    peer_addr: Option<SocketAddr>,
    /// tokio mutex - held across the caller's I/O
    stream: Mutex<Option<TcpStream>>,
    state: StateWatch,
    created_at: Instant,
}

impl TcpConnection {
    /// The resolved remote socket address.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Run `f` against the underlying stream.
    ///
    /// An I/O error drops the stream and moves the connection to `TransientFailure`.
    pub async fn with_stream<T, F>(&self, f: F) -> TransportResult<T>
    where
        F: for<'s> FnOnce(&'s mut TcpStream) -> BoxFuture<'s, io::Result<T>>,
    {
        if self.state.get().is_terminal() {
            return Err(TransportError::Closed);
        }

        let mut guard = self.stream.lock().await;
        let Some(stream) = guard.as_mut() else {
            return Err(TransportError::ConnectionLost(format!(
                "stream to {} is gone",
                self.address
            )));
        };

        match f(stream).await {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!(address = %self.address, error = %e, "I/O failure on TCP connection");
                guard.take();
                self.state.set(ConnectionState::TransientFailure);
                Err(e.into())
            }
        }
    }

    /// Mark the connection as failed after an error detected outside [`with_stream`](Self::with_stream).
    pub fn mark_failed(&self) {
        if self.state.set(ConnectionState::TransientFailure) {
            debug!(address = %self.address, "TCP connection marked as failed");
        }
    }
}

impl Connection for TcpConnection {
    fn address(&self) -> &str {
        &self.address
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    fn created_at(&self) -> Instant {
        self.created_at
    }

    fn wait_for_state_change(&self, from: ConnectionState) -> BoxFuture<'_, ConnectionState> {
        Box::pin(self.state.changed_from(from))
    }

    fn close(&self) -> TransportResult<()> {
        if !self.state.set(ConnectionState::Shutdown) {
            return Err(TransportError::Closed);
        }

        // A caller may be mid-I/O; the stream is then dropped with the connection.
        if let Ok(mut guard) = self.stream.try_lock() {
            guard.take();
        }
        debug!(address = %self.address, "TCP connection closed");
        Ok(())
    }
}
