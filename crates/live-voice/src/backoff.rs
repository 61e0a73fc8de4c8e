//! Reconnection policy: exponential backoff with jitter and an attempt ceiling.
//!
//! After the n-th consecutive failure the next attempt waits
//! `min(base * 2^(n-1) + jitter, max_delay)` where jitter is uniform in
//! `[0, 1s)`. Once `max_attempts` attempts have failed, no further attempt is
//! made. A successful session setup resets the counter.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ReconnectConfig;

type JitterFn = Arc<dyn Fn() -> Duration + Send + Sync>;

#[derive(Clone)]
pub struct ReconnectPolicy {
    base: Duration,
    max_delay: Duration,
    max_attempts: u32,
    failures: u32,
    jitter: JitterFn,
}

impl ReconnectPolicy {
    pub fn new(config: &ReconnectConfig) -> Self {
        let jitter: JitterFn = if config.jitter {
            Arc::new(|| Duration::from_secs_f64(rand::random::<f64>()))
        } else {
            Arc::new(|| Duration::ZERO)
        };
        Self {
            base: config.base_delay(),
            max_delay: config.max_delay(),
            max_attempts: config.max_attempts,
            failures: 0,
            jitter,
        }
    }

    /// Replace the jitter source (deterministic tests).
    pub fn with_jitter(mut self, jitter: impl Fn() -> Duration + Send + Sync + 'static) -> Self {
        self.jitter = Arc::new(jitter);
        self
    }

    /// Record a failed attempt. Returns the delay before the next one, or
    /// `None` when the ceiling has been reached.
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if self.is_exhausted() {
            None
        } else {
            Some(self.delay_for(self.failures))
        }
    }

    /// Count an attempt that is retried immediately (credential refresh).
    /// Returns false when the ceiling has been reached.
    pub fn record_immediate_retry(&mut self) -> bool {
        self.failures = self.failures.saturating_add(1);
        !self.is_exhausted()
    }

    /// Delay after `failures` consecutive failures.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        let backoff = self
            .base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay);
        backoff.saturating_add((self.jitter)()).min(self.max_delay)
    }

    pub fn is_exhausted(&self) -> bool {
        self.failures >= self.max_attempts
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

impl fmt::Debug for ReconnectPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectPolicy")
            .field("base", &self.base)
            .field("max_delay", &self.max_delay)
            .field("max_attempts", &self.max_attempts)
            .field("failures", &self.failures)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy::new(&ReconnectConfig::default()).with_jitter(|| Duration::ZERO)
    }

    #[test]
    fn test_delays_double_until_cap() {
        let policy = ReconnectPolicy::new(&ReconnectConfig {
            max_attempts: 10,
            ..Default::default()
        })
        .with_jitter(|| Duration::ZERO);
        let delays: Vec<u64> = (1..=7).map(|n| policy.delay_for(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_jitter_added_but_capped() {
        let policy = policy().with_jitter(|| Duration::from_millis(900));
        assert_eq!(policy.delay_for(1), Duration::from_millis(1_900));
        assert_eq!(policy.delay_for(6), Duration::from_secs(30));
    }

    #[test]
    fn test_random_jitter_within_bounds() {
        let policy = ReconnectPolicy::new(&ReconnectConfig::default());
        for _ in 0..50 {
            let delay = policy.delay_for(2);
            assert!(delay >= Duration::from_secs(2));
            assert!(delay < Duration::from_secs(3));
        }
    }

    #[test]
    fn test_ceiling_and_reset() {
        let mut policy = policy();
        for _ in 0..4 {
            assert!(policy.record_failure().is_some());
        }
        assert_eq!(policy.record_failure(), None);
        assert!(policy.is_exhausted());

        policy.reset();
        assert_eq!(policy.failures(), 0);
        assert_eq!(policy.record_failure(), Some(Duration::from_secs(1)));
    }
}
