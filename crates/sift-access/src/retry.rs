//! Backoff policies
//!
//! Two flavours of exponential backoff:
//! - [`RetryPolicy`]: attempt budget and doubling delay used by the pool's
//!   retrying executor
//! - [`ExponentialBackoff`]: stateful cooldown that grows each time a circuit
//!   re-trips and resets once it closes

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry budget for pooled execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    /// Delay before the first retry
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Upper bound for any single delay
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            backoff_ms: default_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that runs the operation exactly once
    pub fn no_retry() -> Self {
        Self {
            attempts: 1,
            ..Default::default()
        }
    }

    /// Set the attempt budget
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Set the initial delay
    pub fn with_backoff(mut self, delay: Duration) -> Self {
        self.backoff_ms = delay.as_millis() as u64;
        self
    }

    /// Set the delay cap
    pub fn with_max_backoff(mut self, delay: Duration) -> Self {
        self.max_backoff_ms = delay.as_millis() as u64;
        self
    }

    /// Attempt budget, never below one
    pub fn max_attempts(&self) -> u32 {
        self.attempts.max(1)
    }

    /// Delay before retry number `retry` (1-indexed): `backoff * 2^(retry-1)`, capped
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        // cap the exponent so the shift cannot overflow
        let exponent = (retry - 1).min(32);
        let delay = self.backoff_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

/// Growing cooldown, used by the circuit breaker between trips
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    multiplier: f64,
    current: Duration,
}

impl ExponentialBackoff {
    /// Create a backoff starting at `base`
    pub fn new(base: Duration, multiplier: f64, max: Duration) -> Self {
        let max = max.max(base);
        Self {
            base,
            max,
            multiplier: if multiplier.is_finite() && multiplier >= 1.0 {
                multiplier
            } else {
                1.0
            },
            current: base,
        }
    }

    /// Current cooldown
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Grow the cooldown; never shrinks, never exceeds the cap
    pub fn grow(&mut self) -> Duration {
        let next = self.current.as_secs_f64() * self.multiplier;
        let next = Duration::from_secs_f64(next.min(self.max.as_secs_f64()));
        self.current = next.max(self.current).min(self.max);
        self.current
    }

    /// Return to the base cooldown
    pub fn reset(&mut self) {
        self.current = self.base;
    }
}
