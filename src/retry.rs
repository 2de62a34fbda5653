//! Retry delays for handler invocations.
//!
//! The delay before attempt `n` (0-indexed, attempt 0 runs immediately) is
//! `interval × 2^n`, then spread by a deviation jitter: the result is drawn
//! uniformly from `[d × (1 - f), d × (1 + f)]` with `f = 0.5`.

use std::time::Duration;

use rand::Rng;

/// Jitter deviation factor applied around each delay.
pub const DEVIATION: f64 = 0.5;

/// Binary exponential backoff with deviation jitter.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    interval: Duration,
    deviation: f64,
}

impl Backoff {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            deviation: DEVIATION,
        }
    }

    /// Disable the jitter, for deterministic delays.
    pub fn without_jitter(mut self) -> Self {
        self.deviation = 0.0;
        self
    }

    /// Base delay before `attempt`, before jitter.
    pub fn base(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        self.interval
            .saturating_mul(2u32.saturating_pow(attempt.min(31)))
    }

    /// Delay to wait before running `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base(attempt);
        if base.is_zero() || self.deviation <= 0.0 {
            return base;
        }
        let base = base.as_secs_f64();
        let low = base * (1.0 - self.deviation);
        let high = base * (1.0 + self.deviation);
        Duration::from_secs_f64(rand::thread_rng().gen_range(low..=high))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_attempt_is_immediate() {
        let backoff = Backoff::new(Duration::from_millis(10));
        assert_eq!(backoff.delay(0), Duration::ZERO);
    }

    #[test]
    fn base_doubles_per_attempt() {
        let backoff = Backoff::new(Duration::from_millis(10)).without_jitter();
        assert_eq!(backoff.delay(1), Duration::from_millis(20));
        assert_eq!(backoff.delay(2), Duration::from_millis(40));
        assert_eq!(backoff.delay(3), Duration::from_millis(80));
    }

    #[test]
    fn jitter_stays_within_deviation() {
        let backoff = Backoff::new(Duration::from_millis(10));
        for _ in 0..100 {
            let delay = backoff.delay(2);
            assert!(delay >= Duration::from_millis(19), "{delay:?}");
            assert!(delay <= Duration::from_millis(61), "{delay:?}");
        }
    }

    #[test]
    fn large_attempts_saturate() {
        let backoff = Backoff::new(Duration::from_secs(1)).without_jitter();
        assert!(backoff.delay(200) >= backoff.delay(31));
    }
}
