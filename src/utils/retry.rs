//! Retry policy and backoff arithmetic shared by the poller, the request stage and the adapters.

use std::time::Duration;

/// Exponential backoff capped at a ceiling.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    /// Delay before the second attempt (or between the first two polls).
    pub base_delay: Duration,

    pub multiplier: f64,

    /// No computed delay ever exceeds this.
    pub ceiling: Duration,
}

impl Backoff {
    pub fn new(base_delay: Duration, ceiling: Duration) -> Self {
        Self {
            base_delay,
            multiplier: 2.0,
            ceiling: ceiling.max(base_delay),
        }
    }

    /// Delay after `attempts` attempts (1-indexed): `base * multiplier^(attempts - 1)`, capped.
    ///
    /// With base=2s, multiplier=2.0, ceiling=10s:
    /// - attempt 1: 2s
    /// - attempt 2: 4s
    /// - attempt 3: 8s
    /// - attempt 4: 10s
    pub fn delay(&self, attempts: u32) -> Duration {
        let exponent = i32::try_from(attempts.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.ceiling.as_secs_f64() {
            return self.ceiling;
        }
        Duration::from_secs_f64(secs)
    }
}

/// Bounded attempt count plus the backoff between attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,

    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, ceiling: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::new(base_delay, ceiling),
        }
    }

    pub fn allows_another(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    pub fn next_delay(&self, attempts: u32) -> Duration {
        self.backoff.delay(attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_increases_until_ceiling() {
        let backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(10));

        assert_eq!(backoff.delay(1), Duration::from_secs(2));
        assert_eq!(backoff.delay(2), Duration::from_secs(4));
        assert_eq!(backoff.delay(3), Duration::from_secs(8));
        assert_eq!(backoff.delay(4), Duration::from_secs(10));
        assert_eq!(backoff.delay(400), Duration::from_secs(10));
    }

    #[test]
    fn attempt_zero_uses_base_delay() {
        let backoff = Backoff::new(Duration::from_secs(3), Duration::from_secs(60));
        assert_eq!(backoff.delay(0), Duration::from_secs(3));
    }

    #[test]
    fn ceiling_never_below_base() {
        let backoff = Backoff::new(Duration::from_secs(30), Duration::from_secs(5));
        assert_eq!(backoff.ceiling, Duration::from_secs(30));
        assert_eq!(backoff.delay(5), Duration::from_secs(30));
    }

    #[test]
    fn policy_counts_first_attempt() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(8));
        assert!(policy.allows_another(1));
        assert!(policy.allows_another(2));
        assert!(!policy.allows_another(3));

        assert!(!RetryPolicy::new(1, Duration::ZERO, Duration::ZERO).allows_another(1));
        assert_eq!(RetryPolicy::new(0, Duration::ZERO, Duration::ZERO).max_attempts, 1);
    }
}
