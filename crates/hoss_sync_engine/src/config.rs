//! Static configuration for the sync engine.
//!
//! Field names follow the service's YAML configuration file, so an embedding
//! binary can deserialize [`EngineConfig`] directly:
//!
//! ```yaml
//! core_services:
//!   - http://core-a/core/v1
//!   - http://core-b/core/v1
//! auth_endpoint: http://auth/auth/v1
//! refresh_intervals:
//!   core_service: 30s
//!   auth_token: 5m
//!   sts_creds: 15m
//! worker_buffer_size: 100
//! worker_instance_count: 4
//! ```

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Core service endpoints to monitor.
    pub core_services: Vec<String>,
    /// Refresh intervals for polled state and credentials.
    pub refresh_intervals: RefreshIntervals,
    /// Auth service endpoint used for service token exchange.
    pub auth_endpoint: String,
    /// Capacity of each core service's work queue.
    pub worker_buffer_size: usize,
    /// Workers per core service.
    pub worker_instance_count: usize,
    /// Capacity of each core service's replay queue.
    pub replay_buffer_size: usize,
    /// Upper bound on how long a forced reload blocks its caller.
    #[serde(with = "humantime_serde")]
    pub force_reload_timeout: Duration,
    /// Delay between enabling a dataset sync and listing its objects.
    #[serde(with = "humantime_serde")]
    pub backfill_delay: Duration,
    /// Readiness probing of core services at startup.
    pub startup_retry: RetryConfig,
}

impl EngineConfig {
    /// Creates a configuration monitoring the given core services.
    pub fn new<I, S>(core_services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            core_services: core_services.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Sets the auth service endpoint.
    pub fn with_auth_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.auth_endpoint = endpoint.into();
        self
    }

    /// Sets the refresh intervals.
    pub fn with_refresh_intervals(mut self, intervals: RefreshIntervals) -> Self {
        self.refresh_intervals = intervals;
        self
    }

    /// Sets the work queue capacity.
    pub fn with_worker_buffer_size(mut self, size: usize) -> Self {
        self.worker_buffer_size = size;
        self
    }

    /// Sets the number of workers per core service.
    pub fn with_worker_instance_count(mut self, count: usize) -> Self {
        self.worker_instance_count = count;
        self
    }

    /// Sets the replay queue capacity.
    pub fn with_replay_buffer_size(mut self, size: usize) -> Self {
        self.replay_buffer_size = size;
        self
    }

    /// Sets the forced reload fallback timeout.
    pub fn with_force_reload_timeout(mut self, timeout: Duration) -> Self {
        self.force_reload_timeout = timeout;
        self
    }

    /// Sets the backfill delay.
    pub fn with_backfill_delay(mut self, delay: Duration) -> Self {
        self.backfill_delay = delay;
        self
    }

    /// Sets the startup readiness retry policy.
    pub fn with_startup_retry(mut self, retry: RetryConfig) -> Self {
        self.startup_retry = retry;
        self
    }

    /// Checks the configuration for values the engine cannot run with.
    pub fn validate(&self) -> SyncResult<()> {
        if self.core_services.is_empty() {
            return Err(SyncError::Config(
                "core_services: at least one core service must be defined".into(),
            ));
        }
        if self.worker_instance_count == 0 {
            return Err(SyncError::Config(
                "worker_instance_count: at least one worker per core service must be defined"
                    .into(),
            ));
        }
        if self.worker_buffer_size == 0 || self.replay_buffer_size == 0 {
            return Err(SyncError::Config("queue capacities must be non-zero".into()));
        }

        let intervals = &self.refresh_intervals;
        for (name, interval) in [
            ("core_service", intervals.core_service),
            ("auth_token", intervals.auth_token),
            ("sts_creds", intervals.sts_creds),
        ] {
            if interval.is_zero() {
                return Err(SyncError::Config(format!(
                    "refresh_intervals.{name}: interval must be non-zero"
                )));
            }
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            core_services: Vec::new(),
            refresh_intervals: RefreshIntervals::default(),
            auth_endpoint: String::new(),
            worker_buffer_size: 100,
            worker_instance_count: 4,
            replay_buffer_size: 100,
            force_reload_timeout: Duration::from_secs(1),
            backfill_delay: Duration::from_secs(3),
            startup_retry: RetryConfig::default(),
        }
    }
}

/// Refresh intervals for polled state and credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshIntervals {
    /// Desired-state poll interval per core service.
    #[serde(with = "humantime_serde")]
    pub core_service: Duration,
    /// Service token renewal interval.
    #[serde(with = "humantime_serde")]
    pub auth_token: Duration,
    /// Object store credential renewal interval.
    #[serde(with = "humantime_serde")]
    pub sts_creds: Duration,
}

impl Default for RefreshIntervals {
    fn default() -> Self {
        Self {
            core_service: Duration::from_secs(30),
            auth_token: Duration::from_secs(5 * 60),
            sts_creds: Duration::from_secs(15 * 60),
        }
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Creates a retry configuration with a fixed 5 second delay.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 1.0,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Calculates the delay before a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        // one minute of readiness probing
        Self::new(12)
    }
}
