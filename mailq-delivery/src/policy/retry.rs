//! Retry policy for delivery attempts.
//!
//! Maps `(attempt_count, failure class)` to either a backoff delay or an
//! immediate dead-letter. The random source is injected so the jitter is
//! reproducible under test.

use std::time::Duration;

use rand::Rng;

/// How a failed attempt was classified by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Transient,
    Permanent,
}

/// What to do with an item after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Defer the item and try again after this delay
    Retry(Duration),
    /// Give up and dead-letter the item
    DeadLetterNow,
}

/// Exponential backoff with bounded jitter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Failed attempts allowed before an item is dead-lettered
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Cap on the un-jittered delay
    pub max_delay: Duration,
    /// Relative jitter in `[0, 1)`; 0.2 means ±20%
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(86400),
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    /// The same policy with an item's own retry budget
    #[must_use]
    pub const fn for_item(self, max_retries: u32) -> Self {
        Self {
            max_retries,
            ..self
        }
    }

    /// Returns `true` if an item with `attempt_count` prior attempts may be
    /// retried after a transient failure.
    #[must_use]
    pub const fn should_retry(&self, attempt_count: u32) -> bool {
        attempt_count < self.max_retries
    }

    /// Un-jittered delay: `min(max_delay, base_delay * 2^attempt_count)`
    #[must_use]
    pub fn backoff(&self, attempt_count: u32) -> Duration {
        // 2^32 already overflows any Duration built from base_delay > 0
        if attempt_count >= 32 {
            return self.max_delay;
        }

        self.base_delay
            .checked_mul(1u32 << attempt_count)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Decide the fate of an item whose latest attempt failed.
    ///
    /// `attempt_count` is the number of attempts recorded *before* the one
    /// that just failed.
    pub fn decide<R: Rng + ?Sized>(
        &self,
        attempt_count: u32,
        class: FailureClass,
        rng: &mut R,
    ) -> RetryDecision {
        if class == FailureClass::Permanent || !self.should_retry(attempt_count) {
            return RetryDecision::DeadLetterNow;
        }

        RetryDecision::Retry(self.jitter(self.backoff(attempt_count), rng))
    }

    fn jitter<R: Rng + ?Sized>(&self, delay: Duration, rng: &mut R) -> Duration {
        if self.jitter_factor <= 0.0 || delay.is_zero() {
            return delay;
        }

        let factor = rng.random_range(-self.jitter_factor..=self.jitter_factor);
        Duration::try_from_secs_f64(delay.as_secs_f64() * (1.0 + factor).max(0.0))
            .unwrap_or(Duration::MAX)
    }
}
