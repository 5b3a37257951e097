use crate::connection::config::DriverConfig;
use crate::core::{DriverError, Result};
use rand::Rng;
use std::time::Duration;

/// Retry budget and backoff schedule for transaction functions.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Stop retrying once this much time has passed since the first attempt.
    pub max_retry_time: Duration,
    /// Optional cap on the number of attempts.
    pub max_attempts: Option<usize>,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Factor applied to the delay after each retry.
    pub multiplier: f64,
    /// Each delay is scaled by a random factor in `1 ± jitter_factor`.
    pub jitter_factor: f64,
    /// Upper bound for a single delay, before jitter.
    pub max_delay: Duration,
    /// Deadline for a single attempt; an attempt that overruns is cancelled.
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&DriverConfig::default())
    }
}

impl From<&DriverConfig> for RetryPolicy {
    fn from(config: &DriverConfig) -> Self {
        Self {
            max_retry_time: config.max_transaction_retry_time,
            max_attempts: config.max_retry_attempts,
            initial_delay: config.initial_retry_delay,
            multiplier: config.retry_delay_multiplier,
            jitter_factor: config.retry_jitter_factor,
            max_delay: config.max_retry_delay,
            attempt_timeout: None,
        }
    }
}

impl RetryPolicy {
    /// A policy that never waits between attempts. Handy in tests.
    pub fn immediate(max_retry_time: Duration) -> Self {
        Self {
            max_retry_time,
            max_attempts: None,
            initial_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter_factor: 0.0,
            max_delay: Duration::ZERO,
            attempt_timeout: None,
        }
    }

    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = Some(attempts.max(1));
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Backoff before retry number `retry` (1-based), without jitter.
    pub fn base_delay(&self, retry: usize) -> Duration {
        let cap = self.max_delay.max(self.initial_delay).as_nanos() as f64;
        let mut delay = self.initial_delay.as_nanos() as f64;
        for _ in 1..retry {
            delay = (delay * self.multiplier.max(1.0)).min(cap);
        }
        Duration::from_nanos(delay.min(cap).round() as u64)
    }

    /// Backoff before retry number `retry` (1-based), with jitter applied.
    pub fn delay_for(&self, retry: usize) -> Duration {
        let base = self.base_delay(retry);
        let jitter = self.jitter_factor.clamp(0.0, 1.0);
        if jitter.is_nan() || jitter == 0.0 || base.is_zero() {
            return base;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
        base.mul_f64(factor.max(0.0))
    }

    /// Rejects settings the backoff schedule cannot use.
    pub fn validate(&self) -> Result<()> {
        if !(self.multiplier >= 1.0) || self.multiplier.is_infinite() {
            return Err(DriverError::Configuration(
                "retry multiplier must be a finite number >= 1.0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(DriverError::Configuration(
                "retry jitter factor must be within 0.0..=1.0".to_string(),
            ));
        }
        if self.max_attempts == Some(0) {
            return Err(DriverError::Configuration(
                "max_attempts must be > 0".to_string(),
            ));
        }
        if self.attempt_timeout.is_some_and(|limit| limit.is_zero()) {
            return Err(DriverError::Configuration(
                "attempt_timeout must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns true when `attempts` attempts taking `elapsed` in total use up the budget.
    pub fn is_exhausted(&self, attempts: usize, elapsed: Duration) -> bool {
        elapsed >= self.max_retry_time || self.max_attempts.is_some_and(|max| attempts >= max)
    }
}
