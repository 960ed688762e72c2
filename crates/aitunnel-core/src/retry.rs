use std::time::Duration;

use rand::Rng;

use aitunnel_common::{BackoffKind, RetryConfig};

/// Statuses that indict the credential rather than the backend.
const KEY_FAILURE_STATUSES: [u16; 2] = [401, 403];
/// Statuses that indict the backend rather than the credential.
const CHANNEL_FAILURE_STATUSES: [u16; 3] = [502, 503, 504];

/// Pure classifier plus backoff schedule. Immutable for the lifetime of a
/// reload epoch; a reload installs a fresh policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    retry_on: Vec<u16>,
    backoff: BackoffKind,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_on: config.retry_on.clone(),
            backoff: config.backoff,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Total attempts allowed per request, the first one included.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    pub fn should_retry(&self, status: u16) -> bool {
        self.retry_on.contains(&status)
    }

    pub fn is_key_failure(status: u16) -> bool {
        KEY_FAILURE_STATUSES.contains(&status)
    }

    pub fn is_channel_failure(status: u16) -> bool {
        CHANNEL_FAILURE_STATUSES.contains(&status)
    }

    /// Backoff before attempt `attempt + 1`; `attempt` is 0-indexed.
    /// Exponential applies ±25 % jitter before the cap so concurrent
    /// retries do not stampede in lockstep.
    pub fn delay(&self, attempt: u32) -> Duration {
        match self.backoff {
            BackoffKind::Fixed => self.base_delay,
            BackoffKind::Exponential => {
                let base = self.base_delay.as_millis() as f64;
                let exp = base * 2f64.powi(attempt.min(16) as i32);
                let jittered = exp * rand::thread_rng().gen_range(0.75..=1.25);
                Duration::from_millis(jittered as u64).min(self.max_delay)
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
