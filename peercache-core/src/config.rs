//! Retry policy shared by every component that dials peers.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of dial attempts before a peer add-event is dropped.
pub const DEFAULT_DIAL_MAX_ATTEMPTS: u32 = 20;

/// Default delay after the first failed attempt.
pub const DEFAULT_DIAL_INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Default growth factor between consecutive delays.
pub const DEFAULT_DIAL_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Bounded exponential backoff.
///
/// The delay after failed attempt `n` (counting from 0) is
/// `initial_backoff * backoff_multiplier^n`, optionally capped at
/// `max_backoff`. With the defaults this is `2^n` seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub backoff_multiplier: f64,
    pub max_backoff: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_DIAL_MAX_ATTEMPTS,
            initial_backoff: DEFAULT_DIAL_INITIAL_BACKOFF,
            backoff_multiplier: DEFAULT_DIAL_BACKOFF_MULTIPLIER,
            max_backoff: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff,
            ..Self::default()
        }
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = Some(max_backoff);
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Delay to wait after failed attempt `attempt` (0-based).
    ///
    /// Saturates instead of overflowing for absurd attempt counts.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.max(1.0).powi(exponent);
        let delay = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);

        match self.max_backoff {
            Some(max) => delay.min(max),
            None => delay,
        }
    }

    /// Whether another attempt is allowed after `attempts_made` failures.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}
