use rand::Rng;
use std::time::Duration;

/// Delay policy between connection attempts
///
/// The engine never gives up on its own: prolonged failure is handled by the
/// suspension rules, so strategies only decide how long to wait.
pub trait ReconnectionStrategy: Send + Sync {
    /// Delay before the next attempt
    ///
    /// # Arguments
    /// * `attempt` - Number of failed attempts in the current sequence (0-indexed)
    fn next_delay(&self, attempt: usize) -> Duration;
}

/// Exponential backoff bounded by a maximum delay
///
/// Delays grow as initial_delay * 2^attempt, capped at max_delay. With jitter
/// enabled each delay is scaled by a random factor in [0.8, 1.0].
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    jitter: bool,
}

impl ExponentialBackoff {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    fn base_delay(&self, attempt: usize) -> Duration {
        let factor = 2u64.saturating_pow(attempt.min(32) as u32);
        let delay = (self.initial_delay.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay.as_millis() as u64))
    }
}

impl ReconnectionStrategy for ExponentialBackoff {
    fn next_delay(&self, attempt: usize) -> Duration {
        let delay = self.base_delay(attempt);
        if self.jitter {
            let factor = rand::thread_rng().gen_range(0.8..=1.0);
            delay.mul_f64(factor)
        } else {
            delay
        }
    }
}

/// Always waits the same amount of time between attempts
#[derive(Debug, Clone)]
pub struct FixedDelay {
    delay: Duration,
}

impl FixedDelay {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl ReconnectionStrategy for FixedDelay {
    fn next_delay(&self, _attempt: usize) -> Duration {
        self.delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_doubles_then_caps() {
        let strategy = ExponentialBackoff::new(Duration::from_millis(500), Duration::from_secs(2));
        let delays: Vec<u128> = (0..5).map(|i| strategy.next_delay(i).as_millis()).collect();
        assert_eq!(delays, vec![500, 1000, 2000, 2000, 2000]);
    }

    #[test]
    fn test_exponential_backoff_huge_attempt_does_not_overflow() {
        let strategy = ExponentialBackoff::new(Duration::from_secs(15), Duration::from_secs(60));
        assert_eq!(strategy.next_delay(usize::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let strategy =
            ExponentialBackoff::new(Duration::from_millis(1000), Duration::from_secs(10)).with_jitter();
        for attempt in 0..50 {
            let base = strategy.base_delay(attempt % 4);
            let delay = strategy.next_delay(attempt % 4);
            assert!(delay <= base);
            assert!(delay >= base.mul_f64(0.8) - Duration::from_millis(1));
        }
    }

    #[test]
    fn test_fixed_delay_is_constant() {
        let strategy = FixedDelay::new(Duration::from_secs(30));
        for attempt in 0..10 {
            assert_eq!(strategy.next_delay(attempt), Duration::from_secs(30));
        }
    }
}
