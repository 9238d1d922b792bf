//! Engine configuration
//!
//! ```rust
//! use denorm_engine::EngineConfig;
//! use std::time::Duration;
//!
//! let config = EngineConfig {
//!     worker_count: 2,
//!     poll_interval: Duration::from_millis(200),
//!     ..EngineConfig::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use crate::constants::{
    DEFAULT_DRAIN_BATCH_LIMIT, DEFAULT_LEASE_SECS, DEFAULT_MAX_ATTEMPTS, DEFAULT_POLL_INTERVAL_MS,
    DEFAULT_RETRY_BASE_MS, DEFAULT_RETRY_MAX_MS, DEFAULT_WORKER_COUNT,
};
use denorm_core::ConfigError;
use std::time::Duration;

/// Worker, lease and retry settings for a [`CascadeEngine`](crate::CascadeEngine).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Concurrent workers started by `spawn_workers` (default: 4)
    pub worker_count: usize,

    /// How often an idle worker polls for claimable tasks (default: 500ms)
    pub poll_interval: Duration,

    /// How long a claim stays exclusive before it can be taken over
    /// (default: 30 seconds)
    pub lease_duration: Duration,

    /// First retry delay; doubled per failed attempt (default: 1 second)
    pub retry_base_delay: Duration,

    /// Cap on the retry delay (default: 5 minutes)
    pub retry_max_delay: Duration,

    /// Failures before a task is parked (default: 8)
    pub max_attempts: u32,

    /// Tasks processed per `drain()` call at most (default: 10000)
    pub drain_batch_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            lease_duration: Duration::from_secs(DEFAULT_LEASE_SECS),
            retry_base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_MS),
            retry_max_delay: Duration::from_millis(DEFAULT_RETRY_MAX_MS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            drain_batch_limit: DEFAULT_DRAIN_BATCH_LIMIT,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

impl EngineConfig {
    /// Create EngineConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `DENORM_WORKER_COUNT`: Concurrent workers (default: 4)
    /// - `DENORM_POLL_INTERVAL_MS`: Idle poll interval (default: 500)
    /// - `DENORM_LEASE_SECS`: Claim lease duration (default: 30)
    /// - `DENORM_RETRY_BASE_MS`: First retry delay (default: 1000)
    /// - `DENORM_RETRY_MAX_MS`: Retry delay cap (default: 300000)
    /// - `DENORM_MAX_ATTEMPTS`: Failures before parking (default: 8)
    /// - `DENORM_DRAIN_BATCH_LIMIT`: Tasks per drain call (default: 10000)
    pub fn from_env() -> Self {
        Self {
            worker_count: env_parse("DENORM_WORKER_COUNT").unwrap_or(DEFAULT_WORKER_COUNT),
            poll_interval: Duration::from_millis(
                env_parse("DENORM_POLL_INTERVAL_MS").unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            ),
            lease_duration: Duration::from_secs(
                env_parse("DENORM_LEASE_SECS").unwrap_or(DEFAULT_LEASE_SECS),
            ),
            retry_base_delay: Duration::from_millis(
                env_parse("DENORM_RETRY_BASE_MS").unwrap_or(DEFAULT_RETRY_BASE_MS),
            ),
            retry_max_delay: Duration::from_millis(
                env_parse("DENORM_RETRY_MAX_MS").unwrap_or(DEFAULT_RETRY_MAX_MS),
            ),
            max_attempts: env_parse("DENORM_MAX_ATTEMPTS").unwrap_or(DEFAULT_MAX_ATTEMPTS),
            drain_batch_limit: env_parse("DENORM_DRAIN_BATCH_LIMIT")
                .unwrap_or(DEFAULT_DRAIN_BATCH_LIMIT),
        }
    }

    /// Create a configuration for development/testing with short delays.
    pub fn development() -> Self {
        Self {
            worker_count: 2,
            poll_interval: Duration::from_millis(50),
            lease_duration: Duration::from_secs(5),
            retry_base_delay: Duration::from_millis(10),
            retry_max_delay: Duration::from_millis(500),
            max_attempts: 3,
            drain_batch_limit: 1_000,
        }
    }

    /// Create a configuration for production with longer leases.
    pub fn production() -> Self {
        Self {
            worker_count: 16,
            lease_duration: Duration::from_secs(120),
            ..Self::default()
        }
    }

    /// Reject settings that would stall the queue.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &str, value: String, reason: &str| ConfigError::InvalidValue {
            field: field.to_string(),
            value,
            reason: reason.to_string(),
        };
        if self.worker_count == 0 {
            return Err(invalid("worker_count", "0".into(), "at least one worker is required"));
        }
        if self.lease_duration.is_zero() {
            return Err(invalid(
                "lease_duration",
                "0s".into(),
                "a zero lease gives no mutual exclusion",
            ));
        }
        if self.max_attempts == 0 {
            return Err(invalid("max_attempts", "0".into(), "must allow at least one attempt"));
        }
        if self.retry_max_delay < self.retry_base_delay {
            return Err(invalid(
                "retry_max_delay",
                format!("{:?}", self.retry_max_delay),
                "must not be below retry_base_delay",
            ));
        }
        Ok(())
    }

    /// Backoff before the retry that follows `attempts` failures.
    pub fn retry_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(20);
        self.retry_base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.retry_max_delay)
    }
}
