use crate::core::config::ClientOptions;
use crate::protocol::ErrorInfo;
use crate::traits::{ExponentialBackoff, FixedDelay, ReconnectionStrategy};
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Attempt history and retry decisions for one connection sequence
///
/// A sequence starts with the first attempt after a successful connection (or
/// after `connect()`) and ends with the next successful connection.
pub struct ReconnectionPolicy {
    attempts: Vec<Instant>,
    connection_state_ttl: Duration,
    custom_host: bool,
    primary_host: String,
    fallback_hosts: Vec<String>,
    remaining_fallbacks: Vec<String>,
    disconnected_strategy: Arc<dyn ReconnectionStrategy>,
    suspended_strategy: Arc<dyn ReconnectionStrategy>,
}

impl ReconnectionPolicy {
    pub fn new(options: &ClientOptions) -> Self {
        let (disconnected_strategy, suspended_strategy) = Self::default_strategies(options);
        Self {
            attempts: Vec::new(),
            connection_state_ttl: options.connection_state_ttl(),
            custom_host: options.is_custom_host(),
            primary_host: options.primary_host().to_string(),
            fallback_hosts: options.fallback_hosts(),
            remaining_fallbacks: Vec::new(),
            disconnected_strategy,
            suspended_strategy,
        }
    }

    /// Exponential backoff while disconnected, fixed delay while suspended
    pub fn default_strategies(
        options: &ClientOptions,
    ) -> (Arc<dyn ReconnectionStrategy>, Arc<dyn ReconnectionStrategy>) {
        (
            Arc::new(ExponentialBackoff::new(
                options.disconnected_retry_timeout(),
                options.max_retry_delay(),
            )),
            Arc::new(FixedDelay::new(options.suspended_retry_timeout())),
        )
    }

    pub fn with_strategies(
        mut self,
        disconnected: Arc<dyn ReconnectionStrategy>,
        suspended: Arc<dyn ReconnectionStrategy>,
    ) -> Self {
        self.disconnected_strategy = disconnected;
        self.suspended_strategy = suspended;
        self
    }

    pub fn record_attempt(&mut self, now: Instant) {
        self.attempts.push(now);
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.len()
    }

    /// Time since the first attempt of this sequence
    pub fn elapsed_since_first_attempt(&self, now: Instant) -> Duration {
        self.attempts
            .first()
            .map(|first| now.saturating_duration_since(*first))
            .unwrap_or_default()
    }

    /// True once the sequence has lasted a full connection-state lifetime
    pub fn should_suspend(&self, now: Instant) -> bool {
        !self.attempts.is_empty() && self.elapsed_since_first_attempt(now) >= self.connection_state_ttl
    }

    /// Whether `error` allows moving to a fallback host
    ///
    /// Reachability is checked separately by the engine through its
    /// connectivity probe.
    pub fn can_fallback(&self, error: &ErrorInfo) -> bool {
        !self.custom_host && !self.fallback_hosts.is_empty() && error.is_fallback_eligible()
    }

    /// Next fallback host of this sequence, in shuffled order
    pub fn next_fallback_host(&mut self) -> Option<String> {
        if self.remaining_fallbacks.is_empty() {
            let mut hosts = self.fallback_hosts.clone();
            hosts.shuffle(&mut rand::thread_rng());
            self.remaining_fallbacks = hosts;
        }
        self.remaining_fallbacks.pop()
    }

    pub fn primary_host(&self) -> &str {
        &self.primary_host
    }

    /// Forget the attempt history after a successful connection
    pub fn reset(&mut self) {
        debug!("Resetting reconnection policy after {} attempts", self.attempts.len());
        self.attempts.clear();
        self.remaining_fallbacks.clear();
    }

    /// The service may shorten or extend the TTL in `connectionDetails`
    pub fn set_connection_state_ttl(&mut self, ttl: Duration) {
        self.connection_state_ttl = ttl;
    }

    pub fn connection_state_ttl(&self) -> Duration {
        self.connection_state_ttl
    }

    /// Delay before retrying from `Disconnected`
    pub fn disconnected_retry_delay(&self) -> Duration {
        let failures = self.attempts.len().saturating_sub(1);
        self.disconnected_strategy.next_delay(failures)
    }

    /// Delay before retrying from `Suspended`
    pub fn suspended_retry_delay(&self) -> Duration {
        self.suspended_strategy.next_delay(self.attempts.len())
    }
}
