//! Retry delay policy for supervised watches.
//!
//! The delay for attempt `n` is `first × factor^n`, clamped to `max`. The
//! base is derived from the attempt number alone, so a retry loop only needs
//! to count attempts.

use std::time::Duration;

/// Exponential backoff with a ceiling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay after the first failed attempt.
    pub first: Duration,
    /// Backoff ceiling.
    pub max: Duration,
    /// Multiplicative growth factor (`>= 1.0`).
    pub factor: f64,
}

impl Default for BackoffPolicy {
    /// 100ms, doubling, capped at 2s.
    fn default() -> Self {
        Self {
            first: Duration::from_millis(100),
            max: Duration::from_secs(2),
            factor: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Doubling policy between `first` and `max`.
    pub fn doubling(first: Duration, max: Duration) -> Self {
        Self {
            first,
            max,
            factor: 2.0,
        }
    }

    /// Delay to wait after the given failed attempt (0-indexed).
    pub fn next(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);

        if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_doubles_to_ceiling() {
        let policy = BackoffPolicy::default();

        assert_eq!(policy.next(0), Duration::from_millis(100));
        assert_eq!(policy.next(1), Duration::from_millis(200));
        assert_eq!(policy.next(2), Duration::from_millis(400));
        assert_eq!(policy.next(3), Duration::from_millis(800));
        assert_eq!(policy.next(4), Duration::from_millis(1600));
        assert_eq!(policy.next(5), Duration::from_secs(2));
        assert_eq!(policy.next(40), Duration::from_secs(2));
    }

    #[test]
    fn test_huge_attempt_stays_clamped() {
        let policy = BackoffPolicy::doubling(Duration::from_millis(10), Duration::from_secs(1));
        assert_eq!(policy.next(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_constant_factor() {
        let policy = BackoffPolicy {
            first: Duration::from_millis(50),
            max: Duration::from_secs(1),
            factor: 1.0,
        };
        for attempt in 0..8 {
            assert_eq!(policy.next(attempt), Duration::from_millis(50));
        }
    }
}
