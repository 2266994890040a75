//! Bounded exponential backoff shared by writers and readers.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy: up to `attempts` tries, waiting `initial_ms` after the first
/// failure and doubling the wait each time up to `max_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Backoff {
    /// Total number of tries, including the first.
    pub attempts: u32,

    /// Wait after the first failed try, in milliseconds.
    pub initial_ms: u64,

    /// Upper bound for any single wait, in milliseconds.
    pub max_ms: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_ms: 100,
            max_ms: 2_000,
        }
    }
}

impl Backoff {
    pub fn new(attempts: u32, initial: Duration, max: Duration) -> Self {
        Self {
            attempts,
            initial_ms: u64::try_from(initial.as_millis()).unwrap_or(u64::MAX),
            max_ms: u64::try_from(max.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Wait before the retry following failed try number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        Duration::from_millis(self.initial_ms.saturating_mul(factor).min(self.max_ms))
    }

    /// The waits between consecutive tries.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.attempts.saturating_sub(1)).map(|attempt| self.delay(attempt))
    }

    /// Longest time a caller can spend waiting across all retries.
    pub fn total(&self) -> Duration {
        self.delays().sum()
    }
}
