//! Exponential backoff with jitter for failed renewals.

use std::time::Duration;

use rand::Rng;

use svidkit_core::BackoffPolicy;

/// Backoff state across consecutive failures.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    delay: Duration,
    failures: u32,
}

impl Backoff {
    /// `fallback_initial` is used when the policy leaves the first delay
    /// unset.
    pub fn new(policy: BackoffPolicy, fallback_initial: Duration) -> Self {
        let max = policy.max_delay;
        let initial = policy.initial_delay.unwrap_or(fallback_initial).min(max);
        Self {
            initial,
            max,
            multiplier: policy.multiplier,
            delay: initial,
            failures: 0,
        }
    }

    /// Record a failure and return how long to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.failures += 1;

        // 0.5x to 1.5x of the delay
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered = Duration::from_secs_f64(self.delay.as_secs_f64() * jitter);

        self.delay = Duration::from_secs_f64(
            (self.delay.as_secs_f64() * self.multiplier).min(self.max.as_secs_f64()),
        );

        jittered
    }

    /// Forget past failures.
    pub fn reset(&mut self) {
        self.delay = self.initial;
        self.failures = 0;
    }

    /// Consecutive failures since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(initial: u64, max: u64) -> BackoffPolicy {
        BackoffPolicy {
            initial_delay: Some(Duration::from_secs(initial)),
            max_delay: Duration::from_secs(max),
            multiplier: 2.0,
        }
    }

    fn within(delay: Duration, base: f64) -> bool {
        let secs = delay.as_secs_f64();
        secs >= base * 0.5 && secs <= base * 1.5
    }

    #[test]
    fn test_delays_grow_until_capped() {
        let mut backoff = Backoff::new(policy(10, 60), Duration::from_secs(1));

        assert!(within(backoff.next_delay(), 10.0));
        assert!(within(backoff.next_delay(), 20.0));
        assert!(within(backoff.next_delay(), 40.0));
        assert!(within(backoff.next_delay(), 60.0));
        assert!(within(backoff.next_delay(), 60.0));
        assert_eq!(backoff.failures(), 5);
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut backoff = Backoff::new(policy(10, 60), Duration::from_secs(1));
        backoff.next_delay();
        backoff.next_delay();

        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert!(within(backoff.next_delay(), 10.0));
    }

    #[test]
    fn test_unset_initial_uses_fallback() {
        let mut backoff = Backoff::new(BackoffPolicy::default(), Duration::from_secs(30));
        assert!(within(backoff.next_delay(), 30.0));
    }

    #[test]
    fn test_initial_never_exceeds_cap() {
        let mut backoff = Backoff::new(policy(600, 300), Duration::from_secs(1));
        assert!(within(backoff.next_delay(), 300.0));
    }
}
