//! Token-bucket rate limiting of captured I/O.
//!
//! The bucket holds up to `burst` byte tokens and refills at `rate` tokens
//! per second. Callers pass the current instant explicitly so the policy is
//! deterministic under test.

use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::config::{LimitAction, LimitConfig};

/// Byte budget refilled continuously over time.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    /// Creates a full bucket.
    #[allow(clippy::cast_precision_loss)]
    pub fn new(rate: u64, burst: u64, now: Instant) -> Self {
        Self {
            rate: rate as f64,
            burst: burst as f64,
            tokens: burst as f64,
            last: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.last = self.last.max(now);
    }

    /// Whole tokens available at `now`.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn available(&mut self, now: Instant) -> usize {
        self.refill(now);
        self.tokens.floor().max(0.0) as usize
    }

    /// Consumes up to `wanted` tokens and returns how many were taken.
    #[allow(clippy::cast_precision_loss)]
    pub fn take_up_to(&mut self, wanted: usize, now: Instant) -> usize {
        let taken = wanted.min(self.available(now));
        self.tokens -= taken as f64;
        taken
    }

    /// Time until `wanted` tokens (capped at the burst size) are available.
    #[allow(clippy::cast_precision_loss)]
    pub fn time_until(&mut self, wanted: usize, now: Instant) -> Duration {
        self.refill(now);
        let target = (wanted as f64).min(self.burst);
        let missing = target - self.tokens;
        if missing <= 0.0 {
            return Duration::ZERO;
        }
        // Never hand out a zero wait while tokens are still missing
        Duration::from_secs_f64(missing / self.rate).max(Duration::from_millis(1))
    }
}

/// Decision for one chunk of captured bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The whole chunk is admitted.
    Admit,
    /// The first `admitted` bytes are recorded, the rest is discarded.
    Drop { admitted: usize, dropped: usize },
    /// The first `admitted` bytes are recorded now; the caller waits `wait`
    /// and checks the remainder again.
    Wait { admitted: usize, wait: Duration },
}

/// Applies the configured [`LimitAction`] on top of a [`TokenBucket`].
#[derive(Debug, Clone)]
pub struct RateLimiter {
    action: LimitAction,
    bucket: TokenBucket,
    dropped: u64,
}

impl RateLimiter {
    pub fn new(config: &LimitConfig, now: Instant) -> Self {
        debug!(
            rate = config.rate,
            burst = config.burst,
            action = %config.action,
            "Rate limiter configured"
        );
        Self {
            action: config.action,
            bucket: TokenBucket::new(config.rate, config.burst, now),
            dropped: 0,
        }
    }

    pub fn action(&self) -> LimitAction {
        self.action
    }

    /// Total bytes discarded so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Decides what happens to `len` bytes arriving at `now`.
    pub fn check(&mut self, len: usize, now: Instant) -> Verdict {
        if self.action == LimitAction::Pass || len == 0 {
            return Verdict::Admit;
        }

        let admitted = self.bucket.take_up_to(len, now);
        if admitted == len {
            return Verdict::Admit;
        }

        let rest = len - admitted;
        match self.action {
            LimitAction::Drop => {
                self.dropped += rest as u64;
                trace!(admitted, dropped = rest, "Rate limit exceeded, dropping");
                Verdict::Drop {
                    admitted,
                    dropped: rest,
                }
            }
            _ => {
                let wait = self.bucket.time_until(rest, now);
                trace!(admitted, ?wait, "Rate limit exceeded, delaying");
                Verdict::Wait { admitted, wait }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(rate: u64, burst: u64, action: LimitAction, now: Instant) -> RateLimiter {
        RateLimiter::new(&LimitConfig { rate, burst, action }, now)
    }

    #[test]
    fn test_bucket_starts_full_and_refills() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(100, 50, t0);
        assert_eq!(bucket.take_up_to(80, t0), 50);
        assert_eq!(bucket.available(t0), 0);
        assert_eq!(bucket.available(t0 + Duration::from_millis(200)), 20);
        assert_eq!(bucket.available(t0 + Duration::from_secs(10)), 50);
    }

    #[test]
    fn test_time_until() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(10, 100, t0);
        bucket.take_up_to(100, t0);
        assert_eq!(bucket.time_until(5, t0), Duration::from_millis(500));
        // Requests beyond the burst only wait for a full bucket
        assert_eq!(bucket.time_until(1_000, t0), Duration::from_secs(10));
        assert_eq!(bucket.time_until(0, t0), Duration::ZERO);
    }

    #[test]
    fn test_pass_admits_everything() {
        let t0 = Instant::now();
        let mut rl = limiter(1, 1, LimitAction::Pass, t0);
        assert_eq!(rl.check(1_000_000, t0), Verdict::Admit);
    }

    #[test]
    fn test_drop_admits_prefix() {
        let t0 = Instant::now();
        let mut rl = limiter(10, 32, LimitAction::Drop, t0);
        assert_eq!(rl.check(20, t0), Verdict::Admit);
        assert_eq!(
            rl.check(20, t0),
            Verdict::Drop {
                admitted: 12,
                dropped: 8
            }
        );
        assert_eq!(
            rl.check(5, t0),
            Verdict::Drop {
                admitted: 0,
                dropped: 5
            }
        );
        assert_eq!(rl.dropped(), 13);

        // One second later ten more bytes fit
        assert_eq!(rl.check(10, t0 + Duration::from_secs(1)), Verdict::Admit);
    }

    #[test]
    fn test_delay_reports_wait_for_remainder() {
        let t0 = Instant::now();
        let mut rl = limiter(10, 32, LimitAction::Delay, t0);
        match rl.check(42, t0) {
            Verdict::Wait { admitted, wait } => {
                assert_eq!(admitted, 32);
                assert_eq!(wait, Duration::from_secs(1));
            }
            other => panic!("expected wait, got {other:?}"),
        }
        assert_eq!(rl.check(10, t0 + Duration::from_secs(1)), Verdict::Admit);
        assert_eq!(rl.dropped(), 0);
    }
}
