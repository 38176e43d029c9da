//! Retry loop with backoff, classification and cancellation.
//!
//! An operation runs at most `max_retries + 1` times. Between attempts the retryer
//! sleeps for the next backoff delay (or a rule-supplied delay), racing the sleep
//! against the caller's [`Context`]. A non-retryable error ends the sequence at once;
//! so does the context, whose error is returned as-is in [`RetryError::Cancelled`].

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::backoff::BackoffStrategy;
use crate::classify::ErrorClassifier;
use crate::config::RetryConfig;
use crate::context::{Context, ContextError};
use crate::stats::{RetryCounters, RetryStats, incr};

/// Why a retry sequence gave up.
#[derive(Error, Debug)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error. `last` is the final attempt's error.
    #[error("retries exhausted after {attempts} attempts: {last}")]
    Exhausted {
        /// Attempts made
        attempts: u32,
        /// Error from the final attempt
        #[source]
        last: E,
    },

    /// The operation failed with an error classified as non-retryable.
    #[error(transparent)]
    Permanent(E),

    /// The caller's context was cancelled or its deadline passed.
    #[error(transparent)]
    Cancelled(ContextError),
}

impl<E> RetryError<E> {
    /// The operation's own error, if the sequence ended with one.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Exhausted { last, .. } | Self::Permanent(last) => Some(last),
            Self::Cancelled(_) => None,
        }
    }

    /// Borrow the operation's own error, if any.
    pub fn last_error(&self) -> Option<&E> {
        match self {
            Self::Exhausted { last, .. } | Self::Permanent(last) => Some(last),
            Self::Cancelled(_) => None,
        }
    }

    /// Returns `true` if the caller's context ended the sequence.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Returns `true` if the sequence ran out of attempts.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

type BackoffFactory = Arc<dyn Fn(&RetryConfig) -> Box<dyn BackoffStrategy> + Send + Sync>;

/// Runs fallible async operations under a [`RetryConfig`].
///
/// Cheap to clone; clones share configuration, classifier and statistics. Each call
/// to [`retry_with_context`](Self::retry_with_context) gets its own backoff state.
#[derive(Clone)]
pub struct Retryer {
    config: Arc<RetryConfig>,
    classifier: Arc<ErrorClassifier>,
    backoff: BackoffFactory,
    stats: Arc<RetryCounters>,
}

impl fmt::Debug for Retryer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retryer")
            .field("config", &self.config)
            .field("classifier", &self.classifier)
            .finish_non_exhaustive()
    }
}

impl Default for Retryer {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl Retryer {
    /// Create a retryer with the default classifier and the backoff `config` describes.
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config: Arc::new(config),
            classifier: Arc::new(ErrorClassifier::default()),
            backoff: Arc::new(RetryConfig::backoff),
            stats: Arc::new(RetryCounters::default()),
        }
    }

    /// Replace the error classifier.
    #[must_use]
    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    /// Replace how a backoff strategy is built for each sequence.
    ///
    /// ```rust
    /// use std::time::Duration;
    /// use tether::{LinearBackoff, RetryConfig, Retryer};
    ///
    /// let retryer = Retryer::new(RetryConfig::default()).with_backoff(|config| {
    ///     Box::new(LinearBackoff::new(
    ///         config.initial_backoff,
    ///         Duration::from_millis(250),
    ///         config.max_backoff,
    ///     ))
    /// });
    /// ```
    #[must_use]
    pub fn with_backoff<F>(mut self, factory: F) -> Self
    where
        F: Fn(&RetryConfig) -> Box<dyn BackoffStrategy> + Send + Sync + 'static,
    {
        self.backoff = Arc::new(factory);
        self
    }

    /// The retry policy.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// The error classifier.
    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    /// Counters accumulated across all sequences run by this retryer and its clones.
    pub fn stats(&self) -> RetryStats {
        self.stats.snapshot()
    }

    /// Run `op` without a deadline or external cancellation.
    pub async fn retry<F, Fut, T, E>(&self, mut op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        self.retry_with_context(&Context::background(), |_| op())
            .await
    }

    /// Run `op` until it succeeds, fails permanently, runs out of attempts, or `ctx` is done.
    ///
    /// Each attempt receives a clone of `ctx` so it can bound its own blocking calls.
    pub async fn retry_with_context<F, Fut, T, E>(
        &self,
        ctx: &Context,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(Context) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        incr(&self.stats.calls);
        let max_attempts = self.config.max_attempts();
        let mut backoff = (self.backoff)(&self.config);
        let mut attempt: u32 = 0;

        loop {
            if let Some(err) = ctx.err() {
                return Err(self.cancelled(err, attempt));
            }

            attempt += 1;
            incr(&self.stats.attempts);

            let outcome = match ctx.run(op(ctx.clone())).await {
                Ok(outcome) => outcome,
                Err(err) => return Err(self.cancelled(err, attempt)),
            };

            let error = match outcome {
                Ok(value) => {
                    if attempt == 1 {
                        incr(&self.stats.first_try_successes);
                    } else {
                        debug!(attempts = attempt, "Operation succeeded after retrying");
                        incr(&self.stats.retried_successes);
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            // The context wins over whatever the operation reported
            if let Some(err) = ctx.err() {
                return Err(self.cancelled(err, attempt));
            }

            let category = self.classifier.classify(&error);
            if !self.classifier.is_category_retryable(category) {
                debug!(
                    attempt,
                    category = %category,
                    error = %error,
                    "Operation failed with non-retryable error"
                );
                incr(&self.stats.permanent_failures);
                return Err(RetryError::Permanent(error));
            }

            if attempt >= max_attempts {
                warn!(attempts = attempt, error = %error, "Retries exhausted");
                incr(&self.stats.exhausted);
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: error,
                });
            }

            let delay = self
                .classifier
                .custom_delay(&error)
                .unwrap_or_else(|| backoff.next_backoff());
            debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                category = %category,
                error = %error,
                "Operation failed, retrying"
            );

            tokio::select! {
                biased;
                err = ctx.done() => return Err(self.cancelled(err, attempt)),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn cancelled<E>(&self, err: ContextError, attempts: u32) -> RetryError<E> {
        debug!(attempts, reason = %err, "Retry sequence stopped by context");
        incr(&self.stats.cancelled);
        RetryError::Cancelled(err)
    }
}
