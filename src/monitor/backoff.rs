//! Reconnect backoff and termination policy.

use std::time::Duration;

use crate::config::{MonitorConfig, RetryPolicy};

/// When a device loop gives up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Stop after this many consecutive failed connection cycles
    Bounded { max_attempts: u32 },
    /// Retry until cancelled
    Unbounded,
}

/// Exponential backoff between connection cycles
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub termination: Termination,
}

impl BackoffPolicy {
    pub fn from_config(config: &MonitorConfig) -> Self {
        let termination = match config.policy {
            RetryPolicy::Bounded => Termination::Bounded {
                max_attempts: config.max_attempts,
            },
            RetryPolicy::Unbounded => Termination::Unbounded,
        };

        Self {
            base: Duration::from_millis(config.base_delay_ms),
            cap: Duration::from_millis(config.max_delay_ms),
            termination,
        }
    }

    /// Delay before the next try after `attempt` consecutive failures
    pub fn delay(&self, attempt: u32) -> Duration {
        backoff_delay(self.base, self.cap, attempt)
    }

    /// Whether `attempt` consecutive failures end the loop
    pub fn exhausted(&self, attempt: u32) -> bool {
        match self.termination {
            Termination::Bounded { max_attempts } => attempt >= max_attempts,
            Termination::Unbounded => false,
        }
    }
}

/// `min(base * 2^(attempt - 1), cap)`; zero for attempt 0.
pub fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(cap).min(cap)
}
