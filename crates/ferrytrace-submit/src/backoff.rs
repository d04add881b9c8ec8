//! Retry policy and status classification
//!
//! After failure number `n` (1-based) a batch is retried only while
//! `n < max_attempts` and the base delay is nonzero. The wait before the
//! next attempt is
//!
//! ```text
//! delay = clamp(base * factor^(n-1), 0, max_delay)
//! wait  = uniform(delay, delay + delay * jitter_fraction)
//! ```

use std::time::Duration;

use ferrytrace_core::config::SubmissionConfig;
use rand::Rng;

/// "HTTP version not supported" never heals by retrying
const VERSION_NOT_SUPPORTED: u16 = 505;

/// How a delivery attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// 2xx
    Delivered,
    /// Server-side or network failure worth retrying
    Transient,
    /// The collector rejected the batch for good
    Permanent,
}

/// Classify a response status; `None` means no response was received.
pub fn classify(status: Option<u16>) -> Classification {
    match status {
        None => Classification::Transient,
        Some(code) if (200..300).contains(&code) => Classification::Delivered,
        Some(VERSION_NOT_SUPPORTED) => Classification::Permanent,
        Some(code) if code >= 500 => Classification::Transient,
        Some(_) => Classification::Permanent,
    }
}

/// Backoff settings for one stream
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub backoff_factor: u32,
    pub max_delay: Duration,
    pub jitter_fraction: f64,
    /// Total attempts, first try included
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(10),
            backoff_factor: 10,
            max_delay: Duration::from_secs(300),
            jitter_fraction: 1.0,
            max_attempts: 3,
        }
    }
}

impl From<&SubmissionConfig> for RetryPolicy {
    fn from(config: &SubmissionConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            backoff_factor: config.backoff_factor,
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter_fraction: config.jitter_fraction,
            max_attempts: config.max_attempts,
        }
    }
}

impl RetryPolicy {
    /// Policy that abandons a batch on its first failure.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Whether a batch that has failed `failures` times gets another attempt.
    pub fn should_retry(&self, failures: u32) -> bool {
        failures < self.max_attempts && !self.base_delay.is_zero()
    }

    /// Delay before the next attempt, without jitter.
    pub fn base_delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1);
        let multiplier = u64::from(self.backoff_factor).saturating_pow(exponent);
        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(multiplier).min(max_ms))
    }

    /// Delay before the next attempt, spread uniformly over
    /// `[delay, delay + delay * jitter_fraction]`.
    pub fn delay_for<R: Rng + ?Sized>(&self, failures: u32, rng: &mut R) -> Duration {
        let lower = self.base_delay_for(failures);
        let jitter = if self.jitter_fraction.is_finite() && self.jitter_fraction > 0.0 {
            self.jitter_fraction
        } else {
            0.0
        };
        let lower_ms = lower.as_millis() as f64;
        let upper_ms = lower_ms + lower_ms * jitter;
        if upper_ms <= lower_ms {
            return lower;
        }
        Duration::from_millis(rng.gen_range(lower_ms..=upper_ms).round() as u64)
    }
}
