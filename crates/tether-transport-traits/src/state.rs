//! Connection health state and its change notifications.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Represents the current health state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No activity; the connection will (re)connect when asked to.
    Idle,
    /// The connection is being established.
    Connecting,
    /// The connection is established and ready for calls.
    Ready,
    /// The connection failed and is waiting to retry on its own.
    TransientFailure,
    /// The connection has been closed. Terminal.
    Shutdown,
}

impl ConnectionState {
    /// A connection may be handed to callers iff it is `Ready` or `Idle`.
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Ready | Self::Idle)
    }

    /// `Shutdown` is the only state a connection never leaves.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Shutdown)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Ready => write!(f, "READY"),
            Self::TransientFailure => write!(f, "TRANSIENT_FAILURE"),
            Self::Shutdown => write!(f, "SHUTDOWN"),
        }
    }
}

/// Shared state cell with change notification, for [`Connection`](crate::Connection)
/// implementors.
///
/// Clones observe and publish the same state. Once `Shutdown` is published further
/// transitions are ignored.
#[derive(Debug, Clone)]
pub struct StateWatch {
    tx: Arc<watch::Sender<ConnectionState>>,
}

impl StateWatch {
    /// Create a cell holding `initial`.
    pub fn new(initial: ConnectionState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Current state.
    pub fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Publish a new state. Returns `true` if the state actually changed.
    pub fn set(&self, state: ConnectionState) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_terminal() || *current == state {
                return false;
            }
            *current = state;
            true
        })
    }

    /// Resolves with the first state different from `from`.
    ///
    /// Returns immediately if the current state already differs.
    pub async fn changed_from(&self, from: ConnectionState) -> ConnectionState {
        let mut rx = self.tx.subscribe();
        match rx.wait_for(|state| *state != from).await {
            Ok(state) => *state,
            // The sender lives as long as `self`; treat a closed channel as shutdown.
            Err(_) => ConnectionState::Shutdown,
        }
    }
}

impl Default for StateWatch {
    fn default() -> Self {
        Self::new(ConnectionState::Idle)
    }
}
