//! Configuration for the manager, pool and retryer.
//!
//! Every struct deserializes with `serde` and falls back to defaults for missing
//! fields. [`TetherConfig::from_file`] loads all of them at once from TOML, YAML or JSON,
//! with `TETHER__`-prefixed environment variables taking precedence.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backoff::{BackoffStrategy, ExponentialBackoff, JitteredBackoff};
use crate::logging::LoggingConfig;
use tether_transport_traits::DialOptions;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found
    #[error("Configuration file not found: {0}")]
    FileNotFound(PathBuf),

    /// Unsupported file format
    #[error("Unsupported configuration file format. Use .toml, .yaml, .yml, or .json")]
    UnsupportedFormat,

    /// Configuration parsing error
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] config::ConfigError),

    /// A value is out of range.
    #[error("Invalid value for `{field}`: {reason}")]
    Invalid {
        /// The offending field
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Retry policy. Immutable once handed to a [`Retryer`](crate::Retryer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt; the operation runs at most `max_retries + 1` times.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for any single delay.
    pub max_backoff: Duration,
    /// Growth factor between delays. Must be greater than 1.0.
    pub backoff_multiple: f64,
    /// Jitter factor in `[0, 1]`; `None` disables jitter.
    pub jitter: Option<f64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            backoff_multiple: 2.0,
            jitter: Some(0.1),
        }
    }
}

impl RetryConfig {
    /// Policy suited to flaky networks: more attempts, gentler growth, more jitter.
    #[must_use]
    pub fn for_network() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(60),
            backoff_multiple: 1.5,
            jitter: Some(0.2),
        }
    }

    /// A single attempt, no retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Set the retry count.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the initial and maximum delay.
    #[must_use]
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Set the growth factor.
    #[must_use]
    pub fn with_multiplier(mut self, multiple: f64) -> Self {
        self.backoff_multiple = multiple;
        self
    }

    /// Set or clear the jitter factor.
    #[must_use]
    pub fn with_jitter(mut self, jitter: Option<f64>) -> Self {
        self.jitter = jitter;
        self
    }

    /// Total number of attempts this policy allows.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Check ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backoff_multiple.is_nan() || self.backoff_multiple <= 1.0 {
            return Err(ConfigError::invalid(
                "backoff_multiple",
                format!("must be greater than 1.0, got {}", self.backoff_multiple),
            ));
        }
        if let Some(jitter) = self.jitter
            && !(0.0..=1.0).contains(&jitter)
        {
            return Err(ConfigError::invalid(
                "jitter",
                format!("must be within [0, 1], got {jitter}"),
            ));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(ConfigError::invalid(
                "initial_backoff",
                format!(
                    "{:?} exceeds max_backoff {:?}",
                    self.initial_backoff, self.max_backoff
                ),
            ));
        }
        Ok(())
    }

    /// A fresh backoff strategy for one retry sequence.
    pub fn backoff(&self) -> Box<dyn BackoffStrategy> {
        let exponential = ExponentialBackoff::new(
            self.initial_backoff,
            self.max_backoff,
            self.backoff_multiple,
        );
        match self.jitter {
            Some(factor) if factor > 0.0 => Box::new(JitteredBackoff::new(exponential, factor)),
            _ => Box::new(exponential),
        }
    }
}

/// Pool sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of connections alive at once, idle ones included.
    pub size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { size: 10 }
    }
}

impl PoolConfig {
    /// A pool of `size` connections.
    pub fn new(size: usize) -> Self {
        Self { size }
    }

    /// Check ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.size == 0 {
            return Err(ConfigError::invalid("size", "pool size must be at least 1"));
        }
        Ok(())
    }
}

/// Connection manager settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Keep-alive, TLS and connect timeout handed to the dialer.
    pub dial: DialOptions,
    /// Longest wait for a new connection to become ready. The caller's context deadline
    /// applies as well; the earlier one wins. `None` waits for the context alone.
    pub ready_timeout: Option<Duration>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            dial: DialOptions::default(),
            ready_timeout: Some(Duration::from_secs(10)),
        }
    }
}

impl ManagerConfig {
    /// Replace the dial options.
    #[must_use]
    pub fn with_dial_options(mut self, dial: DialOptions) -> Self {
        self.dial = dial;
        self
    }

    /// Set or clear the readiness timeout.
    #[must_use]
    pub fn with_ready_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Check ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dial.connect_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "dial.connect_timeout",
                "must be greater than zero",
            ));
        }
        if self.ready_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::invalid(
                "ready_timeout",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Everything the resilience layer reads, in one document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    /// Connection manager settings
    pub manager: ManagerConfig,
    /// Pool sizing
    pub pool: PoolConfig,
    /// Retry policy
    pub retry: RetryConfig,
    /// Log output
    pub logging: LoggingConfig,
}

impl TetherConfig {
    /// Load configuration from a file (TOML, YAML, or JSON).
    ///
    /// The format is chosen by extension. Environment variables prefixed with
    /// `TETHER__` override file settings, using `__` between nested keys
    /// (`TETHER__POOL__SIZE=32`).
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use tether::TetherConfig;
    ///
    /// let config = TetherConfig::from_file("tether.toml").expect("Failed to load config");
    /// ```
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_file_with_prefix(path, "TETHER")
    }

    /// Load configuration from a file with a custom environment prefix.
    pub fn from_file_with_prefix(
        path: impl AsRef<Path>,
        env_prefix: &str,
    ) -> Result<Self, ConfigError> {
        use config::{Config, File, FileFormat};

        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let format = match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => FileFormat::Toml,
            Some("yaml" | "yml") => FileFormat::Yaml,
            Some("json") => FileFormat::Json,
            _ => return Err(ConfigError::UnsupportedFormat),
        };

        let config = Config::builder()
            .add_source(File::new(
                path.to_str().ok_or(ConfigError::UnsupportedFormat)?,
                format,
            ))
            .add_source(
                config::Environment::with_prefix(env_prefix)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let loaded: Self = config.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.manager.validate()?;
        self.pool.validate()?;
        self.retry.validate()
    }
}
