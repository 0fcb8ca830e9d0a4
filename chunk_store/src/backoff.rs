//! Retry pacing for the position-collision loop in `append`.

use rand::prelude::*;
use std::time::Duration;

/// Retry policy for writes that lost their position to another writer.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Ceiling of the first retry delay.
    pub init_backoff: Duration,

    /// Largest ceiling a delay is ever drawn from.
    pub max_backoff: Duration,

    /// Ceiling growth factor per retry round.
    pub base: f64,

    /// Upper bound on retry rounds before the caller gives up.
    ///
    /// A stale local sequence normally converges after one reload; the cap
    /// exists so that a persistently stale counter surfaces as an error
    /// instead of a livelock.
    pub max_attempts: usize,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            init_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(100),
            base: 3.,
            max_attempts: 16,
        }
    }
}

/// Hands out the delay before each retry round of a single write.
///
/// Delays use full jitter: every round draws uniformly from zero up to a
/// ceiling, and the ceiling multiplies by [`base`](BackoffConfig::base) per
/// round until it reaches [`max_backoff`](BackoffConfig::max_backoff). The
/// round cap is part of the state: once
/// [`max_attempts`](BackoffConfig::max_attempts) rounds are spent,
/// [`next`](Self::next) reports exhaustion instead of a delay.
pub struct Backoff {
    ceiling: Duration,
    max_backoff: Duration,
    base: f64,
    attempts_left: usize,
    rng: Option<Box<dyn RngCore + Sync + Send>>,
}

impl std::fmt::Debug for Backoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backoff")
            .field("ceiling", &self.ceiling)
            .field("attempts_left", &self.attempts_left)
            .finish_non_exhaustive()
    }
}

impl Backoff {
    /// Fresh retry state for one write attempt.
    pub fn new(config: &BackoffConfig) -> Self {
        Self::new_with_rng(config, None)
    }

    /// Like [`new`](Self::new), with the jitter source injected so tests can
    /// pin the drawn delays.
    pub fn new_with_rng(
        config: &BackoffConfig,
        rng: Option<Box<dyn RngCore + Sync + Send>>,
    ) -> Self {
        Self {
            ceiling: config.init_backoff,
            max_backoff: config.max_backoff,
            base: config.base,
            attempts_left: config.max_attempts,
            rng,
        }
    }

    /// The delay to sleep before the next retry round, or `None` once the
    /// configured rounds are spent.
    pub fn next(&mut self) -> Option<Duration> {
        self.attempts_left = self.attempts_left.checked_sub(1)?;

        let fraction = match self.rng.as_mut() {
            Some(rng) => rng.gen::<f64>(),
            None => thread_rng().gen::<f64>(),
        };
        let delay = self.ceiling.mul_f64(fraction);

        self.ceiling = self.ceiling.mul_f64(self.base).min(self.max_backoff);
        Some(delay)
    }
}
