//! Retry policy shared by store reconnects and image pulls.

use std::time::Duration;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

/// Attempt bound plus capped exponential delay with jitter.
///
/// Delays are `base_delay * 2^(attempt-1)` capped at `max_delay`; the caller
/// adds up to `jitter` of random slack on top.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first; `None` (key omitted) retries forever.
    pub max_attempts: Option<u32>,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl RetryPolicy {
    /// Bounded policy for image pulls.
    pub fn pull() -> Self {
        Self {
            max_attempts: Some(5),
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            jitter_ms: 250,
        }
    }

    /// Unbounded policy for coordination-store reconnects.
    pub fn reconnect() -> Self {
        Self {
            max_attempts: None,
            base_delay_ms: 200,
            max_delay_ms: 30_000,
            jitter_ms: 250,
        }
    }

    /// Back-to-back attempts with no delay.
    pub fn immediate(max_attempts: Option<u32>) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
            jitter_ms: 0,
        }
    }

    pub fn validate(&self, label: &str) -> Result<()> {
        if self.max_attempts == Some(0) {
            return Err(anyhow!("{label}.max_attempts must be > 0"));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(anyhow!("{label}.max_delay_ms must be >= base_delay_ms"));
        }
        Ok(())
    }

    /// True when another attempt is allowed after `attempts_made` failures.
    pub fn allows(&self, attempts_made: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempts_made < max)
    }

    /// Delay before retry number `retry` (1-based), without jitter.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(32);
        let delay = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Add `sample * jitter` to `delay`; `sample` is clamped to `[0, 1]`.
    pub fn with_jitter(&self, delay: Duration, sample: f64) -> Duration {
        let sample = sample.clamp(0.0, 1.0);
        delay + Duration::from_millis((self.jitter_ms as f64 * sample) as u64)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: *self,
            retries: 0,
        }
    }
}

/// Stateful cursor over a policy's delays; reset after a success.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    retries: u32,
}

impl Backoff {
    pub fn next_delay(&mut self) -> Duration {
        self.retries = self.retries.saturating_add(1);
        self.policy.delay_for(self.retries)
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn reset(&mut self) {
        self.retries = 0;
    }
}
