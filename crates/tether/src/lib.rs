//! # Tether
//!
//! Client-side resilience between application code and a remote RPC service:
//! - **Connection manager** keeping one healthy connection per address
//! - **Connection pool** bounding how many connections are checked out at once
//! - **Retry** with exponential, linear or jittered backoff
//! - **Error classification** deciding what is worth retrying
//!
//! ## Architecture
//!
//! ```text
//! tether/
//! ├── context.rs   # Cancellation + deadline carrier
//! ├── backoff.rs   # Exponential / linear / jittered wait durations
//! ├── classify.rs  # Error -> category -> retry decision
//! ├── retry.rs     # Retry loop
//! ├── manager.rs   # One connection per address, replaced when unhealthy
//! ├── pool/        # Bounded checkout/return over a connection factory
//! ├── config.rs    # Serde configuration and file loading
//! ├── stats.rs     # Counters and snapshots for observability
//! └── logging.rs   # tracing-subscriber initialisation
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use tether::{
//!     ConnectionManager, ConnectionPool, Context, ManagerConfig, ManagerFactory, PoolConfig,
//!     RetryConfig, Retryer,
//! };
//! use tether_tcp::TcpDialer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConnectionManager::new(TcpDialer::new(), ManagerConfig::default());
//! let pool = ConnectionPool::new(
//!     ManagerFactory::new(manager, "127.0.0.1:50051"),
//!     PoolConfig::new(8),
//! )?;
//! let retryer = Retryer::new(RetryConfig::default());
//!
//! let ctx = Context::with_timeout(Duration::from_secs(5));
//! retryer
//!     .retry_with_context(&ctx, |ctx| {
//!         let pool = pool.clone();
//!         async move {
//!             let conn = pool.get(&ctx).await?;
//!             // issue the call on `conn` ...
//!             drop(conn); // returned to the pool
//!             Ok::<_, tether::Error>(())
//!         }
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::must_use_candidate
)]

pub mod backoff;
pub mod classify;
pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod manager;
pub mod pool;
pub mod retry;
pub mod stats;

#[cfg(test)]
mod test_support;

pub use backoff::{BackoffStrategy, ExponentialBackoff, JitteredBackoff, LinearBackoff};
pub use classify::{ClassificationRule, ErrorCategory, ErrorClassifier};
pub use config::{ConfigError, ManagerConfig, PoolConfig, RetryConfig, TetherConfig};
pub use context::{Context, ContextError};
pub use error::{Error, Result};
pub use logging::{LogFormat, LoggingConfig};
pub use manager::ConnectionManager;
pub use pool::{ConnectionFactory, ConnectionPool, DialerFactory, ManagerFactory, PooledConnection};
pub use retry::{RetryError, Retryer};
pub use stats::{ManagerStats, PoolStats, RetryStats};

// Re-export the transport contracts so most users need a single dependency
pub use tether_transport_traits::{
    BoxFuture, Connection, ConnectionState, DialOptions, Dialer, KeepAliveConfig, RpcStatus,
    StateWatch, StatusCode, TlsConfig, TransportError, TransportResult,
};
