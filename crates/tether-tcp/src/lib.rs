//! # Tether TCP Dialer
//!
//! Plain TCP implementation of the [`Dialer`] contract for the tether resilience layer.
//!
//! ## Features
//!
//! - **Connect timeout**: bounded by [`DialOptions::connect_timeout`]
//! - **Keep-alive**: TCP keep-alive idle time and probe interval come from
//!   [`KeepAliveConfig`](tether_transport_traits::KeepAliveConfig)
//! - **Health tracking**: I/O errors move the connection to `TransientFailure` so the
//!   manager and pool replace it
//!
//! TLS is not terminated here; dialing with `tls.enabled = true` is rejected as a
//! configuration error.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tether_tcp::TcpDialer;
//! use tether_transport_traits::{DialOptions, Dialer};
//! use tokio::io::AsyncWriteExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let dialer = TcpDialer::new();
//! let options = DialOptions::default();
//! let conn = dialer.dial("127.0.0.1:50051", &options).await?;
//!
//! conn.with_stream(|stream| Box::pin(async move { stream.write_all(b"ping\n").await }))
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

mod dialer;

pub use dialer::{TcpConnection, TcpDialer};

// Re-export transport traits for convenience
pub use tether_transport_traits::{
    Connection, ConnectionState, DialOptions, Dialer, TransportError, TransportResult,
};
