//! Exponential retry delay.

use std::time::Duration;

/// `delay(n) = min(base * 2^(n-1), max)` for retry `n >= 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before retry number `retry` (1-based). Retry 0 is the initial
    /// attempt and never waits.
    pub fn delay(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(retry - 1);
        self.base.saturating_mul(factor).min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_until_ceiling() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(1000));
        assert_eq!(backoff.delay(0), Duration::ZERO);
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
        assert_eq!(backoff.delay(5), Duration::from_millis(1000));
        assert_eq!(backoff.delay(60), Duration::from_millis(1000));
    }

    #[test]
    fn test_zero_base_never_waits() {
        let backoff = Backoff::new(Duration::ZERO, Duration::from_secs(5));
        assert_eq!(backoff.delay(3), Duration::ZERO);
    }
}
