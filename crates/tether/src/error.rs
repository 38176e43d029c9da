//! Error types for the resilience layer.

use std::time::Duration;

use thiserror::Error;

use crate::classify::ErrorCategory;
use crate::config::ConfigError;
use crate::context::ContextError;
use tether_transport_traits::{ConnectionState, TransportError};

/// Result type for manager and pool operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the connection manager and pool.
///
/// The type is `Clone` so that a single dial outcome can be handed to every caller
/// waiting on the same address.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// Dialing or health-checking a connection failed.
    #[error("connection to {address} failed: {source}")]
    Connection {
        /// The target address
        address: String,
        /// The transport failure
        #[source]
        source: TransportError,
    },

    /// The connection did not become ready before the deadline.
    #[error("connection to {address} not ready after {waited:?} (last state {state})")]
    Timeout {
        /// The target address
        address: String,
        /// How long the caller waited
        waited: Duration,
        /// The state observed when the deadline passed
        state: ConnectionState,
    },

    /// Every pool slot is checked out and the free-list is empty.
    #[error("connection pool exhausted ({pool_size} connections in use)")]
    ResourceExhausted {
        /// The configured pool size
        pool_size: usize,
    },

    /// The pool has been closed.
    #[error("connection pool closed")]
    PoolClosed,

    /// The manager has been closed.
    #[error("connection manager closed")]
    ManagerClosed,

    /// The caller's context was cancelled or its deadline passed.
    #[error(transparent)]
    Context(#[from] ContextError),

    /// Closing a connection failed.
    #[error("failed to close connection to {address}: {source}")]
    Close {
        /// The connection's address
        address: String,
        /// The transport failure
        #[source]
        source: TransportError,
    },

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

impl Error {
    /// Build a [`Error::Connection`].
    pub fn connection(address: impl Into<String>, source: TransportError) -> Self {
        Self::Connection {
            address: address.into(),
            source,
        }
    }

    /// The category the default classifier assigns to this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connection { source, .. } | Self::Close { source, .. } => {
                ErrorCategory::from_transport(source)
            }
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::ResourceExhausted { .. } => ErrorCategory::ResourceExhausted,
            Self::Context(err) => ErrorCategory::from_context(*err),
            Self::PoolClosed | Self::ManagerClosed => ErrorCategory::Cancelled,
            Self::Configuration(_) => ErrorCategory::InvalidArgument,
        }
    }

    /// Returns `true` if the error came from the caller's own context.
    pub fn is_context(&self) -> bool {
        matches!(self, Self::Context(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;
    use tether_transport_traits::{RpcStatus, StatusCode};

    #[test]
    fn test_connection_error_keeps_source() {
        let err = Error::connection(
            "db:5432",
            TransportError::ConnectionFailed("refused".to_string()),
        );
        assert!(err.to_string().contains("db:5432"));
        let source = err.source().map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("Connection failed: refused"));
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            Error::ResourceExhausted { pool_size: 4 }.category(),
            ErrorCategory::ResourceExhausted
        );
        assert_eq!(Error::PoolClosed.category(), ErrorCategory::Cancelled);
        assert_eq!(
            Error::Context(ContextError::DeadlineExceeded).category(),
            ErrorCategory::Timeout
        );
        assert_eq!(
            Error::Context(ContextError::Cancelled).category(),
            ErrorCategory::Cancelled
        );
        assert_eq!(
            Error::connection(
                "a:1",
                TransportError::Rpc(RpcStatus::new(StatusCode::NotFound, "gone"))
            )
            .category(),
            ErrorCategory::NotFound
        );
    }

    #[test]
    fn test_context_error_is_transparent() {
        let err = Error::from(ContextError::Cancelled);
        assert!(err.is_context());
        assert_eq!(err.to_string(), "context cancelled");
    }
}
