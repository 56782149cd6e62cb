//! Adaptive audit timeout and retry backoff

use std::time::Duration;
use warden_core::config::AuditConfig;

/// Bounds for the adaptive audit timeout
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeoutPolicy {
    /// Timeout without history
    pub default: Duration,
    /// Lower clamp
    pub min: Duration,
    /// Upper clamp
    pub max: Duration,
    /// Multiplier on the average duration
    pub buffer_factor: f64,
}

impl TimeoutPolicy {
    /// Build from configuration
    #[must_use]
    pub fn from_config(config: &AuditConfig) -> Self {
        Self {
            default: config.default_timeout(),
            min: config.min_timeout(),
            max: config.max_timeout(),
            buffer_factor: config.buffer_factor,
        }
    }

    /// `clamp(average × buffer, min, max)`, or the default when there is no history
    #[must_use]
    pub fn adaptive(&self, average: Option<Duration>) -> Duration {
        let raw = match average {
            Some(avg) => Duration::try_from_secs_f64(avg.as_secs_f64() * self.buffer_factor)
                .unwrap_or(self.max),
            None => self.default,
        };
        raw.clamp(self.min, self.max.max(self.min))
    }

    /// Same as [`adaptive`](Self::adaptive) for an average given in minutes
    #[must_use]
    pub fn adaptive_minutes(&self, average_minutes: Option<f64>) -> Duration {
        let average = average_minutes
            .filter(|m| m.is_finite() && *m >= 0.0)
            .map(|m| Duration::try_from_secs_f64(m * 60.0).unwrap_or(self.max));
        self.adaptive(average)
    }
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self::from_config(&AuditConfig::default())
    }
}

/// Exponential backoff between audit retries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry; doubles after each
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Build from configuration
    #[must_use]
    pub fn from_config(config: &AuditConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.retry_base_delay(),
        }
    }

    /// Delay before retry `k` (1-based): `base × 2^(k-1)`, saturating
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.base_delay.saturating_mul(1u32 << exponent)
    }

    /// Total attempts including the initial one
    #[inline]
    #[must_use]
    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&AuditConfig::default())
    }
}
