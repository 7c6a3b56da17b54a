//! Exponential backoff with jitter for failed registration requests.

use crate::config::MatchmakingConfig;
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Jitter is drawn uniformly from `[jitter_min, 1.0]`
    pub jitter_min: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &MatchmakingConfig) -> Self {
        Self {
            base: Duration::from_millis(config.retry_base_ms),
            cap: Duration::from_millis(config.retry_cap_ms),
            jitter_min: config.retry_jitter_min,
        }
    }

    /// `min(base * 2^(attempt-1), cap)`; attempt 0 is treated as attempt 1.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    pub fn delay_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        self.backoff_for_attempt(attempt)
            .mul_f64(jitter.clamp(self.jitter_min.min(1.0), 1.0))
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let low = self.jitter_min.clamp(0.0, 1.0);
        let jitter = if low >= 1.0 {
            1.0
        } else {
            rand::thread_rng().gen_range(low..=1.0)
        };
        self.delay_with_jitter(attempt, jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&MatchmakingConfig::default())
    }
}
