//! Exponential backoff for tunnel restarts.

use std::time::Duration;

/// Capped exponential backoff: `min(base * 2^failures, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Base delay duration.
    pub base: Duration,
    /// Maximum delay cap.
    pub max: Duration,
}

impl Backoff {
    pub const fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before the next start of a location that has failed
    /// `consecutive_failures` times in a row.
    pub fn delay(&self, consecutive_failures: u32) -> Duration {
        let multiplier = 2u64.saturating_pow(consecutive_failures);
        let base_millis = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        let delay = Duration::from_millis(base_millis.saturating_mul(multiplier));
        delay.min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_sequence() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(10));
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(2), Duration::from_millis(400));
        assert_eq!(backoff.delay(3), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_respects_max() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(backoff.delay(2), Duration::from_millis(400));
        assert_eq!(backoff.delay(3), Duration::from_millis(500));
        assert_eq!(backoff.delay(4), Duration::from_millis(500));
    }

    #[test]
    fn test_delays_never_decrease() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(3600));
        let mut previous = Duration::ZERO;
        for failures in 0..100 {
            let delay = backoff.delay(failures);
            assert!(delay >= previous);
            assert!(delay <= Duration::from_secs(3600));
            previous = delay;
        }
    }
}
