//! Exponential backoff.

use std::time::Duration;

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(5),
            max: Duration::from_secs(300),
            jitter: 0.0,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: 0.0,
        }
    }

    /// Calculate delay for the given attempt number (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(62) as i32;
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(exp);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter = if self.jitter > 0.0 {
            let spread = rand::random::<f64>() * 2.0 - 1.0; // -1.0 to 1.0
            delay * self.jitter * spread
        } else {
            0.0
        };

        Duration::from_millis((delay + jitter).max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        let policy = BackoffPolicy::new(Duration::from_millis(5), Duration::from_secs(300));

        assert_eq!(policy.delay(0), Duration::from_millis(5));
        assert_eq!(policy.delay(1), Duration::from_millis(10));
        assert_eq!(policy.delay(2), Duration::from_millis(20));
    }

    #[test]
    fn test_backoff_max() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(5));

        assert_eq!(policy.delay(10), Duration::from_secs(5));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_jitter_stays_in_range() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            jitter: 0.25,
        };

        for _ in 0..32 {
            let d = policy.delay(1);
            assert!(d >= Duration::from_millis(150));
            assert!(d <= Duration::from_millis(250));
        }
    }
}
