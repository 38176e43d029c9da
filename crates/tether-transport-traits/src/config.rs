//! Dial configuration types.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// TLS protocol version specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TlsVersion {
    /// TLS 1.2 protocol version.
    Tls12,
    /// TLS 1.3 protocol version.
    #[default]
    Tls13,
}

/// TLS settings handed to a dialer.
///
/// Certificate material is only referenced here; loading and the handshake belong to
/// the transport implementation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Whether the dialer should establish a TLS session.
    pub enabled: bool,

    /// Minimum TLS protocol version to accept.
    pub min_version: TlsVersion,

    /// Whether to validate server certificates.
    pub validate_certificates: bool,

    /// Server name used for SNI and certificate validation, when it differs from the host.
    pub server_name: Option<String>,

    /// Path to a PEM bundle of additional trusted CA certificates.
    pub ca_cert_path: Option<PathBuf>,

    /// Client certificate and key paths for mutual TLS.
    pub client_cert_path: Option<PathBuf>,

    /// Private key matching `client_cert_path`.
    pub client_key_path: Option<PathBuf>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_version: TlsVersion::default(),
            validate_certificates: true,
            server_name: None,
            ca_cert_path: None,
            client_cert_path: None,
            client_key_path: None,
        }
    }
}

impl TlsConfig {
    /// Plaintext connections.
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    /// TLS 1.3 with certificate validation (recommended).
    #[must_use]
    pub fn modern() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    /// Check if this configuration skips certificate validation.
    #[must_use]
    pub const fn is_insecure(&self) -> bool {
        self.enabled && !self.validate_certificates
    }
}

/// Keep-alive probing for established connections.
///
/// Maps onto the socket's TCP keep-alive options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepAliveConfig {
    /// Idle time after which the first probe is sent (`TCP_KEEPIDLE`).
    pub time: Duration,

    /// Time between unacknowledged probes (`TCP_KEEPINTVL`).
    pub interval: Duration,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            time: Duration::from_secs(10),
            interval: Duration::from_secs(3),
        }
    }
}

/// Everything a [`Dialer`](crate::Dialer) needs besides the target address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DialOptions {
    /// Keep-alive probing; `None` disables it.
    pub keep_alive: Option<KeepAliveConfig>,

    /// TLS settings.
    pub tls: TlsConfig,

    /// Upper bound for establishing the underlying socket.
    pub connect_timeout: Duration,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            keep_alive: Some(KeepAliveConfig::default()),
            tls: TlsConfig::default(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_defaults_are_plaintext() {
        let tls = TlsConfig::default();
        assert!(!tls.enabled);
        assert!(tls.validate_certificates);
        assert!(!tls.is_insecure());
    }

    #[test]
    fn test_insecure_only_when_enabled() {
        let mut tls = TlsConfig::modern();
        assert!(!tls.is_insecure());
        tls.validate_certificates = false;
        assert!(tls.is_insecure());
    }

    #[test]
    fn test_dial_options_default() {
        let options = DialOptions::default();
        assert_eq!(options.connect_timeout, Duration::from_secs(5));
        assert_eq!(
            options.keep_alive.map(|k| k.time),
            Some(Duration::from_secs(10))
        );
    }
}
