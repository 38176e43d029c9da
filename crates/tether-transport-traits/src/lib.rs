//! # Tether Transport Traits
//!
//! Contracts between the tether resilience layer and the transport that actually
//! talks to a remote RPC service. Transport crates implement these traits; the
//! connection manager and pool in `tether` are generic over them.
//!
//! ## Overview
//!
//! This crate defines:
//! - **Traits**: [`Connection`], [`Dialer`]
//! - **Types**: [`ConnectionState`], [`StateWatch`], [`DialOptions`]
//! - **Errors**: [`TransportError`], [`TransportResult`], [`RpcStatus`], [`StatusCode`]
//! - **Config**: [`KeepAliveConfig`], [`TlsConfig`]
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tether_transport_traits::{Connection, ConnectionState, Dialer, DialOptions, StateWatch};
//!
//! #[derive(Debug)]
//! struct MyConnection { address: String, state: StateWatch, /* ... */ }
//!
//! impl Connection for MyConnection {
//!     fn address(&self) -> &str { &self.address }
//!     fn state(&self) -> ConnectionState { self.state.get() }
//!     // ... other trait methods
//! }
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

mod config;
mod error;
mod state;
mod status;
mod traits;

// Re-export all public items
pub use config::{DialOptions, KeepAliveConfig, TlsConfig, TlsVersion};
pub use error::{TransportError, TransportResult};
pub use state::{ConnectionState, StateWatch};
pub use status::{RpcStatus, StatusCode};
pub use traits::{BoxFuture, Connection, Dialer};
