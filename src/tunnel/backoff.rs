//! Reconnect backoff

use std::time::Duration;

/// Exponential delay: `min(base * 2^failures, max)`
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before the next attempt after `failures` consecutive failures
    pub fn delay(&self, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_until_cap() {
        let backoff = Backoff::new(Duration::from_secs(3), Duration::from_secs(30));
        assert_eq!(backoff.delay(0), Duration::from_secs(3));
        assert_eq!(backoff.delay(1), Duration::from_secs(6));
        assert_eq!(backoff.delay(2), Duration::from_secs(12));
        assert_eq!(backoff.delay(3), Duration::from_secs(24));
        assert_eq!(backoff.delay(4), Duration::from_secs(30));
        assert_eq!(backoff.delay(10), Duration::from_secs(30));
    }

    #[test]
    fn test_huge_failure_count_saturates() {
        let backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(30));
        assert_eq!(backoff.delay(31), Duration::from_secs(30));
        assert_eq!(backoff.delay(64), Duration::from_secs(30));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_formula() {
        let base = Duration::from_millis(250);
        let cap = Duration::from_secs(10);
        let backoff = Backoff::new(base, cap);
        for n in 0..12 {
            assert_eq!(backoff.delay(n), (base * 2u32.pow(n)).min(cap));
        }
    }
}
