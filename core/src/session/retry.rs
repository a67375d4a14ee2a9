//! Retry policies for connecting and for commands.
//!
//! A policy only answers two questions: may attempt `n` be retried, and how
//! long to wait before it. Whether an error is retryable at all is decided by
//! the caller (`TransportError::is_retryable`).

use std::time::Duration;

use crate::config::{BackoffStrategy, EngineConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub strategy: BackoffStrategy,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, strategy: BackoffStrategy, base_delay_ms: u64) -> Self {
        RetryPolicy {
            max_retries,
            strategy,
            base_delay_ms,
            max_delay_ms: u64::MAX,
        }
    }

    /// Cap every delay at `max_delay_ms`.
    pub fn capped(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    /// Policy for establishing sessions.
    pub fn for_connect(config: &EngineConfig) -> Self {
        RetryPolicy::new(
            config.connect_retries,
            config.backoff_strategy,
            config.connect_backoff_ms,
        )
        .capped(config.max_backoff_ms)
    }

    /// Policy for re-issuing a command after a transport flake.
    pub fn for_commands(config: &EngineConfig) -> Self {
        RetryPolicy::new(
            config.command_retries,
            config.backoff_strategy,
            config.command_backoff_ms,
        )
        .capped(config.max_backoff_ms)
    }

    /// Whether the given retry number (0-indexed) is within the budget.
    pub fn should_retry(&self, retry: u32) -> bool {
        retry < self.max_retries
    }

    /// Total attempts allowed: the first try plus the retries.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before the given retry. Retry 0 follows the first failure.
    pub fn delay_ms(&self, retry: u32) -> u64 {
        let raw = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay_ms,
            BackoffStrategy::Linear => self.base_delay_ms.saturating_mul(retry as u64 + 1),
            BackoffStrategy::Exponential => self
                .base_delay_ms
                .saturating_mul(2u64.saturating_pow(retry.min(32))),
        };
        raw.min(self.max_delay_ms)
    }

    pub fn delay(&self, retry: u32) -> Duration {
        Duration::from_millis(self.delay_ms(retry))
    }
}

impl Default for RetryPolicy {
    /// 3 retries, exponential backoff from 1s, capped at 30s.
    fn default() -> Self {
        RetryPolicy::new(3, BackoffStrategy::Exponential, 1000).capped(30_000)
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy() {
        let p = RetryPolicy::default();
        assert_eq!(p.max_retries, 3);
        assert_eq!(p.base_delay_ms, 1000);
        assert_eq!(p.max_attempts(), 4);
        assert!(matches!(p.strategy, BackoffStrategy::Exponential));
    }

    #[test]
    fn should_retry_within_budget() {
        let p = RetryPolicy::new(2, BackoffStrategy::Fixed, 100);
        assert!(p.should_retry(0));
        assert!(p.should_retry(1));
        assert!(!p.should_retry(2));
    }

    #[test]
    fn zero_retries_means_single_attempt() {
        let p = RetryPolicy::new(0, BackoffStrategy::Fixed, 100);
        assert!(!p.should_retry(0));
        assert_eq!(p.max_attempts(), 1);
    }

    #[test]
    fn fixed_and_linear_delay() {
        let fixed = RetryPolicy::new(3, BackoffStrategy::Fixed, 500);
        assert_eq!(fixed.delay_ms(0), 500);
        assert_eq!(fixed.delay_ms(4), 500);

        let linear = RetryPolicy::new(5, BackoffStrategy::Linear, 1000);
        assert_eq!(linear.delay_ms(0), 1000);
        assert_eq!(linear.delay_ms(2), 3000);
    }

    #[test]
    fn exponential_delay_is_capped() {
        let p = RetryPolicy::new(10, BackoffStrategy::Exponential, 1000).capped(5000);
        assert_eq!(p.delay_ms(0), 1000);
        assert_eq!(p.delay_ms(1), 2000);
        assert_eq!(p.delay_ms(2), 4000);
        assert_eq!(p.delay_ms(3), 5000);
        assert_eq!(p.delay_ms(60), 5000);
    }

    #[test]
    fn built_from_config() {
        let config = EngineConfig {
            connect_retries: 5,
            connect_backoff_ms: 200,
            command_retries: 1,
            command_backoff_ms: 50,
            max_backoff_ms: 800,
            ..EngineConfig::default()
        };
        let connect = RetryPolicy::for_connect(&config);
        assert_eq!(connect.max_retries, 5);
        assert_eq!(connect.delay_ms(4), 800);
        let commands = RetryPolicy::for_commands(&config);
        assert_eq!(commands.max_retries, 1);
        assert_eq!(commands.delay_ms(0), 50);
    }
}
