//! Exponential backoff shared by remote retries and serial reconnects

use rand::Rng;
use std::time::Duration;

use crate::config::{ReconnectConfig, RetryConfig};

/// Doubling delay schedule with an upper bound
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    jitter: bool,
    attempt: u32,
}

impl Backoff {
    /// Create a schedule starting at `base` and never exceeding `cap`
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            jitter: false,
            attempt: 0,
        }
    }

    /// Schedule for remote write retries
    pub fn for_retry(config: &RetryConfig) -> Self {
        Self::new(config.base_delay, config.max_delay).with_jitter(config.jitter)
    }

    /// Schedule for serial reconnects
    pub fn for_reconnect(config: &ReconnectConfig) -> Self {
        Self::new(config.initial_delay, config.max_delay)
    }

    /// Add up to 10% random extra delay
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay for a given zero-based attempt, without jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Advance the schedule and return the next delay
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);

        if self.jitter && !delay.is_zero() {
            let extra = delay.as_millis() as u64 / 10;
            if extra > 0 {
                let extra = rand::thread_rng().gen_range(0..=extra);
                return delay + Duration::from_millis(extra);
            }
        }
        delay
    }

    /// Attempts taken so far
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}
