//! Transport error types.

use std::time::Duration;
use thiserror::Error;

use crate::status::RpcStatus;

/// A specialized `Result` type for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Represents errors a transport can report to the resilience layer.
///
/// Payloads are strings rather than boxed sources so the error stays `Clone`; a single
/// dial result may be shared between every caller waiting on the same address.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransportError {
    /// Failed to establish a connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// An established connection was lost.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Connection establishment timed out.
    #[error(
        "Connection to {address} timed out after {timeout:?}. \
         If this is expected, increase `DialOptions::connect_timeout`"
    )]
    ConnectionTimeout {
        /// The address being dialed
        address: String,
        /// The timeout duration that was exceeded
        timeout: Duration,
    },

    /// The operation did not complete within the specified timeout.
    #[error("Operation timed out")]
    Timeout,

    /// The connection has been shut down and cannot be used.
    #[error("Connection closed")]
    Closed,

    /// The dialer was configured with invalid parameters.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// The remote service answered with a non-OK status.
    #[error(transparent)]
    Rpc(#[from] RpcStatus),

    /// An underlying I/O error occurred.
    #[error("IO error: {message}")]
    Io {
        /// The I/O error kind, kept for classification
        kind: std::io::ErrorKind,
        /// The rendered I/O error
        message: String,
    },
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl TransportError {
    /// Returns the remote status carried by this error, if any.
    pub fn rpc_status(&self) -> Option<&RpcStatus> {
        match self {
            Self::Rpc(status) => Some(status),
            _ => None,
        }
    }
}
