//! Retry schedule: attempts per candidate, backoff and effort stepping.

use super::EffortLevel;
use crate::config::DispatchConfig;
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub retries_per_model: u32,
    pub base: Duration,
    pub cap: Duration,
    pub jitter: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            retries_per_model: config.retries_per_model,
            base: Duration::from_millis(config.backoff_base_ms),
            cap: Duration::from_millis(config.backoff_cap_ms),
            jitter: Duration::from_millis(config.jitter_ms),
        }
    }

    /// Attempts per candidate: the first try plus the retries.
    pub fn max_attempts(&self) -> u32 {
        self.retries_per_model.saturating_add(1)
    }

    /// `min(base × 2^(attempt−1), cap)` for the 1-based attempt that just failed.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << exponent).min(self.cap)
    }

    /// [`base_delay`](Self::base_delay) plus uniform jitter in `[0, jitter]`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        self.base_delay(attempt) + jitter
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&DispatchConfig::default())
    }
}

/// Effort for a 1-based attempt: step down the list, then stay on the last level.
pub fn effort_for_attempt(levels: &[EffortLevel], attempt: u32) -> EffortLevel {
    let index = (attempt.saturating_sub(1) as usize).min(levels.len().saturating_sub(1));
    levels.get(index).copied().unwrap_or_default()
}
