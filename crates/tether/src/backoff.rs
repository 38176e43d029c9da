//! Backoff strategies for retry sequences
//!
//! Every strategy is a small state machine private to one retry sequence. The
//! first call to [`BackoffStrategy::next_backoff`] yields the initial delay; later calls
//! grow it until the configured maximum. Jitter spreads the delays of many clients
//! that started backing off at the same moment.

use std::fmt;
use std::time::Duration;

/// Computes successive wait durations between attempts.
pub trait BackoffStrategy: Send + fmt::Debug {
    /// The next wait duration. Advances the internal state.
    fn next_backoff(&mut self) -> Duration;

    /// Restore the initial state before reusing the strategy for an unrelated sequence.
    fn reset(&mut self);
}

/// Multiplies the delay by a constant factor after each call, capped at `max`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    current: Duration,
}

impl ExponentialBackoff {
    /// Create an exponential backoff. `multiplier` should be greater than 1.0.
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            max,
            multiplier,
            current: initial,
        }
    }

    fn grow(&self) -> Duration {
        Duration::try_from_secs_f64(self.current.as_secs_f64() * self.multiplier)
            .map_or(self.max, |next| next.min(self.max))
    }
}

impl BackoffStrategy for ExponentialBackoff {
    fn next_backoff(&mut self) -> Duration {
        let delay = self.current.min(self.max);
        self.current = self.grow();
        delay
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Adds a constant increment after each call, capped at `max`.
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    initial: Duration,
    increment: Duration,
    max: Duration,
    current: Duration,
}

impl LinearBackoff {
    /// Create a linear backoff.
    pub fn new(initial: Duration, increment: Duration, max: Duration) -> Self {
        Self {
            initial,
            increment,
            max,
            current: initial,
        }
    }
}

impl BackoffStrategy for LinearBackoff {
    fn next_backoff(&mut self) -> Duration {
        let delay = self.current.min(self.max);
        self.current = self.current.saturating_add(self.increment).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Exponential backoff with each delay perturbed by up to `±factor` of itself.
#[derive(Debug, Clone)]
pub struct JitteredBackoff {
    inner: ExponentialBackoff,
    factor: f64,
    rng: fastrand::Rng,
}

impl JitteredBackoff {
    /// Wrap `inner`; `factor` is clamped to `[0, 1]`.
    pub fn new(inner: ExponentialBackoff, factor: f64) -> Self {
        Self {
            inner,
            factor: clamp_factor(factor),
            rng: fastrand::Rng::new(),
        }
    }

    /// Use a seeded generator, for reproducible delays.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = fastrand::Rng::with_seed(seed);
        self
    }

    /// The effective jitter factor.
    pub fn factor(&self) -> f64 {
        self.factor
    }
}

impl BackoffStrategy for JitteredBackoff {
    fn next_backoff(&mut self) -> Duration {
        let base = self.inner.next_backoff();
        apply_jitter(base, self.factor, self.rng.f64() * 2.0 - 1.0)
    }

    fn reset(&mut self) {
        self.inner.reset();
    }
}

fn clamp_factor(factor: f64) -> f64 {
    if factor.is_nan() {
        0.0
    } else {
        factor.clamp(0.0, 1.0)
    }
}

/// `base + base * factor * unit`, where `unit` is in `[-1, 1]`.
///
/// A non-positive result is replaced by `base / 2`.
fn apply_jitter(base: Duration, factor: f64, unit: f64) -> Duration {
    let base_secs = base.as_secs_f64();
    let jittered = base_secs + base_secs * factor * unit;
    if jittered <= 0.0 {
        return base / 2;
    }
    Duration::try_from_secs_f64(jittered).unwrap_or(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn test_exponential_sequence_is_capped() {
        let mut backoff = ExponentialBackoff::new(ms(100), ms(1000), 2.0);
        let delays: Vec<_> = (0..7).map(|_| backoff.next_backoff()).collect();
        assert_eq!(
            delays,
            vec![ms(100), ms(200), ms(400), ms(800), ms(1000), ms(1000), ms(1000)]
        );
    }

    #[test]
    fn test_exponential_reset() {
        let mut backoff = ExponentialBackoff::new(ms(100), ms(1000), 2.0);
        backoff.next_backoff();
        backoff.next_backoff();
        backoff.reset();
        assert_eq!(backoff.next_backoff(), ms(100));
    }

    #[test]
    fn test_exponential_survives_overflow() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(u64::MAX / 2), Duration::MAX, 4.0);
        backoff.next_backoff();
        assert_eq!(backoff.next_backoff(), Duration::MAX);
    }

    #[test]
    fn test_linear_sequence_is_capped() {
        let mut backoff = LinearBackoff::new(ms(100), ms(150), ms(500));
        let delays: Vec<_> = (0..5).map(|_| backoff.next_backoff()).collect();
        assert_eq!(delays, vec![ms(100), ms(250), ms(400), ms(500), ms(500)]);

        backoff.reset();
        assert_eq!(backoff.next_backoff(), ms(100));
    }

    #[test]
    fn test_jitter_zero_factor_is_exact() {
        let inner = ExponentialBackoff::new(ms(100), ms(1000), 2.0);
        let mut backoff = JitteredBackoff::new(inner, 0.0);
        assert_eq!(backoff.next_backoff(), ms(100));
        assert_eq!(backoff.next_backoff(), ms(200));
    }

    #[test]
    fn test_jitter_factor_is_clamped() {
        let inner = ExponentialBackoff::new(ms(100), ms(1000), 2.0);
        assert_eq!(JitteredBackoff::new(inner.clone(), 3.0).factor(), 1.0);
        assert_eq!(JitteredBackoff::new(inner.clone(), -1.0).factor(), 0.0);
        assert_eq!(JitteredBackoff::new(inner, f64::NAN).factor(), 0.0);
    }

    #[test]
    fn test_jitter_non_positive_falls_back_to_half_base() {
        assert_eq!(apply_jitter(ms(100), 1.0, -1.0), ms(50));
        assert_eq!(apply_jitter(ms(100), 0.5, 1.0), ms(150));
    }

    #[test]
    fn test_seeded_jitter_is_reproducible() {
        let make = || {
            JitteredBackoff::new(ExponentialBackoff::new(ms(100), ms(5000), 2.0), 0.5)
                .with_seed(42)
        };
        let mut a = make();
        let mut b = make();
        for _ in 0..6 {
            assert_eq!(a.next_backoff(), b.next_backoff());
        }
    }

    proptest! {
        #[test]
        fn prop_exponential_never_exceeds_max(
            initial_ms in 1u64..10_000,
            max_ms in 1u64..60_000,
            multiplier in 1.01f64..10.0,
            calls in 1usize..40,
        ) {
            let mut backoff = ExponentialBackoff::new(ms(initial_ms), ms(max_ms), multiplier);
            let mut previous = Duration::ZERO;
            for _ in 0..calls {
                let delay = backoff.next_backoff();
                prop_assert!(delay <= ms(max_ms));
                prop_assert!(delay >= previous);
                previous = delay;
            }
        }

        #[test]
        fn prop_jitter_stays_within_band(
            base_ms in 1u64..60_000,
            factor in 0.0f64..=1.0,
            unit in -1.0f64..=1.0,
        ) {
            let base = ms(base_ms);
            let delay = apply_jitter(base, factor, unit);
            prop_assert!(delay > Duration::ZERO);
            prop_assert!(delay.as_secs_f64() <= base.as_secs_f64() * (1.0 + factor) + 1e-9);
        }
    }
}
