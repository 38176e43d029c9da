//! Error classification: error value -> category -> retry decision.
//!
//! Classification runs in a fixed order and stops at the first answer:
//!
//! 1. caller-supplied matcher functions
//! 2. message-pattern rules
//! 3. typed inspection of the error and its `source()` chain (`tether::Error`,
//!    [`TransportError`], [`RpcStatus`], `std::io::Error`, [`ContextError`])
//! 4. message heuristics for untyped errors
//!
//! Anything left over is [`ErrorCategory::Unknown`], which is retried.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::context::ContextError;
use crate::error::Error;
use tether_transport_traits::{RpcStatus, StatusCode, TransportError};

/// Closed set of failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Dial or health failure.
    Connection,
    /// The remote service is temporarily unavailable.
    Unavailable,
    /// A deadline passed.
    Timeout,
    /// A capacity limit was hit.
    ResourceExhausted,
    /// The request itself is malformed.
    InvalidArgument,
    /// The requested entity does not exist.
    NotFound,
    /// The caller lacks permission.
    PermissionDenied,
    /// The caller has no valid credentials.
    Unauthenticated,
    /// The caller or the component gave up.
    Cancelled,
    /// Unrecognized failure.
    Unknown,
}

impl ErrorCategory {
    /// Default retry decision for this category.
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Connection
                | Self::Unavailable
                | Self::Timeout
                | Self::ResourceExhausted
                | Self::Unknown
        )
    }

    /// Default category for a remote status code.
    pub const fn from_status_code(code: StatusCode) -> Self {
        match code {
            StatusCode::Unavailable | StatusCode::Aborted => Self::Unavailable,
            StatusCode::DeadlineExceeded => Self::Timeout,
            StatusCode::ResourceExhausted => Self::ResourceExhausted,
            StatusCode::InvalidArgument
            | StatusCode::OutOfRange
            | StatusCode::FailedPrecondition
            | StatusCode::AlreadyExists
            | StatusCode::Unimplemented => Self::InvalidArgument,
            StatusCode::NotFound => Self::NotFound,
            StatusCode::PermissionDenied => Self::PermissionDenied,
            StatusCode::Unauthenticated => Self::Unauthenticated,
            StatusCode::Cancelled => Self::Cancelled,
            StatusCode::Ok | StatusCode::Unknown | StatusCode::Internal | StatusCode::DataLoss => {
                Self::Unknown
            }
        }
    }

    /// Category for an I/O error kind, if the kind is meaningful on its own.
    pub fn from_io_kind(kind: io::ErrorKind) -> Option<Self> {
        use io::ErrorKind;
        match kind {
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
            | ErrorKind::AddrNotAvailable => Some(Self::Connection),
            ErrorKind::TimedOut => Some(Self::Timeout),
            ErrorKind::PermissionDenied => Some(Self::PermissionDenied),
            ErrorKind::InvalidInput | ErrorKind::InvalidData => Some(Self::InvalidArgument),
            ErrorKind::NotFound => Some(Self::NotFound),
            _ => None,
        }
    }

    /// Category for a context error. A passed deadline is a timeout, so a per-attempt
    /// deadline can be retried; explicit cancellation is not.
    pub fn from_context(err: ContextError) -> Self {
        match err {
            ContextError::Cancelled => Self::Cancelled,
            ContextError::DeadlineExceeded => Self::Timeout,
        }
    }

    /// Default category for a transport failure.
    pub fn from_transport(err: &TransportError) -> Self {
        classify_transport(err, Self::from_status_code)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connection => "connection",
            Self::Unavailable => "unavailable",
            Self::Timeout => "timeout",
            Self::ResourceExhausted => "resource_exhausted",
            Self::InvalidArgument => "invalid_argument",
            Self::NotFound => "not_found",
            Self::PermissionDenied => "permission_denied",
            Self::Unauthenticated => "unauthenticated",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

fn classify_transport(
    err: &TransportError,
    status: impl Fn(StatusCode) -> ErrorCategory,
) -> ErrorCategory {
    match err {
        TransportError::ConnectionFailed(_)
        | TransportError::ConnectionLost(_)
        | TransportError::Closed => ErrorCategory::Connection,
        TransportError::ConnectionTimeout { .. } | TransportError::Timeout => {
            ErrorCategory::Timeout
        }
        TransportError::ConfigurationError(_) => ErrorCategory::InvalidArgument,
        TransportError::Rpc(rpc) => status(rpc.code()),
        TransportError::Io { kind, .. } => {
            ErrorCategory::from_io_kind(*kind).unwrap_or(ErrorCategory::Connection)
        }
        _ => ErrorCategory::Unknown,
    }
}

/// Message-pattern rule, matched case-insensitively against the error's message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationRule {
    /// Substring to look for
    pub pattern: String,
    /// Category assigned on match
    pub category: ErrorCategory,
    /// Override delay before the next attempt
    #[serde(default)]
    pub custom_delay: Option<Duration>,
}

impl ClassificationRule {
    /// Create a rule without a custom delay.
    pub fn new(pattern: impl Into<String>, category: ErrorCategory) -> Self {
        Self {
            pattern: pattern.into().to_lowercase(),
            category,
            custom_delay: None,
        }
    }

    /// Wait `delay` instead of the backoff delay when this rule matches.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.custom_delay = Some(delay);
        self
    }

    fn matches(&self, message: &str) -> bool {
        message.contains(&self.pattern.to_lowercase())
    }
}

type Matcher = Arc<dyn Fn(&(dyn StdError + 'static)) -> Option<ErrorCategory> + Send + Sync>;

/// Maps errors to categories and categories to retry decisions.
///
/// Cheap to clone; the retryer shares one instance across concurrent calls.
#[derive(Clone, Default)]
pub struct ErrorClassifier {
    codes: HashMap<StatusCode, ErrorCategory>,
    rules: Vec<ClassificationRule>,
    matchers: Vec<Matcher>,
    decisions: HashMap<ErrorCategory, bool>,
}

impl fmt::Debug for ErrorClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorClassifier")
            .field("codes", &self.codes)
            .field("rules", &self.rules)
            .field("matchers", &self.matchers.len())
            .field("decisions", &self.decisions)
            .finish()
    }
}

impl ErrorClassifier {
    /// Classifier with the built-in tables only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a service-specific status code to `category`.
    #[must_use]
    pub fn with_code(mut self, code: StatusCode, category: ErrorCategory) -> Self {
        self.codes.insert(code, category);
        self
    }

    /// Add a message-pattern rule. Rules are checked in insertion order.
    #[must_use]
    pub fn with_rule(mut self, rule: ClassificationRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Add a matcher that may recognise domain error types.
    ///
    /// Matchers run before everything else; returning `None` defers to the next step.
    #[must_use]
    pub fn with_matcher<F>(mut self, matcher: F) -> Self
    where
        F: Fn(&(dyn StdError + 'static)) -> Option<ErrorCategory> + Send + Sync + 'static,
    {
        self.matchers.push(Arc::new(matcher));
        self
    }

    /// Override the retry decision for a whole category.
    #[must_use]
    pub fn with_retry_decision(mut self, category: ErrorCategory, retry: bool) -> Self {
        self.decisions.insert(category, retry);
        self
    }

    /// Category of `err`.
    pub fn classify(&self, err: &(dyn StdError + 'static)) -> ErrorCategory {
        if let Some(category) = self.matchers.iter().find_map(|matcher| matcher(err)) {
            return category;
        }

        let message = err.to_string().to_lowercase();
        if let Some(rule) = self.rules.iter().find(|rule| rule.matches(&message)) {
            return rule.category;
        }

        let mut current = Some(err);
        while let Some(e) = current {
            if let Some(category) = self.typed_category(e) {
                return category;
            }
            current = e.source();
        }

        message_category(&message)
    }

    /// Whether `err` should be retried.
    pub fn is_retryable(&self, err: &(dyn StdError + 'static)) -> bool {
        self.is_category_retryable(self.classify(err))
    }

    /// Retry decision for `category`, honouring overrides.
    pub fn is_category_retryable(&self, category: ErrorCategory) -> bool {
        self.decisions
            .get(&category)
            .copied()
            .unwrap_or_else(|| category.is_retryable())
    }

    /// Delay demanded by the first matching rule that carries one.
    pub fn custom_delay(&self, err: &(dyn StdError + 'static)) -> Option<Duration> {
        if self.rules.is_empty() {
            return None;
        }
        let message = err.to_string().to_lowercase();
        self.rules
            .iter()
            .filter(|rule| rule.custom_delay.is_some())
            .find(|rule| rule.matches(&message))
            .and_then(|rule| rule.custom_delay)
    }

    fn status_category(&self, code: StatusCode) -> ErrorCategory {
        self.codes
            .get(&code)
            .copied()
            .unwrap_or_else(|| ErrorCategory::from_status_code(code))
    }

    fn transport_category(&self, err: &TransportError) -> ErrorCategory {
        classify_transport(err, |code| self.status_category(code))
    }

    fn typed_category(&self, err: &(dyn StdError + 'static)) -> Option<ErrorCategory> {
        if let Some(err) = err.downcast_ref::<Error>() {
            return Some(match err {
                Error::Connection { source, .. } | Error::Close { source, .. } => {
                    self.transport_category(source)
                }
                other => other.category(),
            });
        }
        if let Some(err) = err.downcast_ref::<TransportError>() {
            return Some(self.transport_category(err));
        }
        if let Some(status) = err.downcast_ref::<RpcStatus>() {
            return Some(self.status_category(status.code()));
        }
        if let Some(err) = err.downcast_ref::<ContextError>() {
            return Some(ErrorCategory::from_context(*err));
        }
        if let Some(err) = err.downcast_ref::<io::Error>() {
            return ErrorCategory::from_io_kind(err.kind());
        }
        None
    }
}

const CONNECTION_PATTERNS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection aborted",
    "network unreachable",
    "host unreachable",
    "no route to host",
    "broken pipe",
];

const TIMEOUT_PATTERNS: &[&str] = &["timeout", "timed out", "deadline exceeded"];

const PERMANENT_PATTERNS: &[(&str, ErrorCategory)] = &[
    ("invalid argument", ErrorCategory::InvalidArgument),
    ("not found", ErrorCategory::NotFound),
    ("permission denied", ErrorCategory::PermissionDenied),
    ("unauthenticated", ErrorCategory::Unauthenticated),
    ("unauthorized", ErrorCategory::Unauthenticated),
];

fn message_category(message: &str) -> ErrorCategory {
    if CONNECTION_PATTERNS.iter().any(|p| message.contains(p)) {
        return ErrorCategory::Connection;
    }
    if TIMEOUT_PATTERNS.iter().any(|p| message.contains(p)) {
        return ErrorCategory::Timeout;
    }
    if message.contains("unavailable") {
        return ErrorCategory::Unavailable;
    }
    PERMANENT_PATTERNS
        .iter()
        .find(|(pattern, _)| message.contains(pattern))
        .map_or(ErrorCategory::Unknown, |(_, category)| *category)
}
