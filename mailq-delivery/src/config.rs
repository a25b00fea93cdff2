use std::time::Duration;

use serde::Deserialize;

use crate::{ConfigError, RetryPolicy};

const fn default_num_workers() -> usize {
    4
}

const fn default_batch_size() -> usize {
    10
}

const fn default_poll_interval() -> f64 {
    1.0
}

const fn default_emit_events() -> bool {
    true
}

const fn default_max_retries() -> u32 {
    5
}

const fn default_shutdown_timeout() -> f64 {
    30.0
}

const fn default_base_retry_delay() -> f64 {
    60.0 // 1 minute
}

const fn default_max_retry_delay() -> f64 {
    86400.0 // 24 hours
}

const fn default_retry_jitter_factor() -> f64 {
    0.2 // ±20%
}

const fn default_lease_timeout() -> f64 {
    300.0 // 5 minutes
}

const fn default_reclaim_interval() -> f64 {
    60.0
}

/// Queue manager tunables
///
/// All durations are in (fractional) seconds. Unknown keys are rejected, and
/// [`validate`](Self::validate) is applied before a manager will accept the
/// configuration; after that it is never modified.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    /// Upper bound on concurrently processed items
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// Maximum items claimed per poll
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Delay between polls that found no capacity or no due items
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: f64,

    /// Whether lifecycle events are delivered to the event sink
    #[serde(default = "default_emit_events")]
    pub emit_events: bool,

    /// Retry budget given to items enqueued without one
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// How long a drain waits for in-flight deliveries when the queue stops
    /// on its own (a fatal store error). `stop` takes its own deadline.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: f64,

    /// Base delay for exponential backoff
    ///
    /// The first retry waits this long; each later one doubles it (with
    /// jitter) up to `max_retry_delay_secs`.
    #[serde(default = "default_base_retry_delay")]
    pub base_retry_delay_secs: f64,

    /// Cap on the backoff delay
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay_secs: f64,

    /// Jitter factor for retry delays, in `[0, 1)`
    ///
    /// A factor of 0.2 means ±20% randomness.
    #[serde(default = "default_retry_jitter_factor")]
    pub retry_jitter_factor: f64,

    /// Age after which a lease is considered abandoned and reclaimed
    #[serde(default = "default_lease_timeout")]
    pub lease_timeout_secs: f64,

    /// How often abandoned leases are swept while running
    #[serde(default = "default_reclaim_interval")]
    pub reclaim_interval_secs: f64,

    /// Lease owner identity; generated when unset
    #[serde(default)]
    pub worker_id: Option<String>,

    /// Seed for the jitter random source; entropy-seeded when unset
    #[serde(default)]
    pub retry_seed: Option<u64>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            batch_size: default_batch_size(),
            poll_interval_secs: default_poll_interval(),
            emit_events: default_emit_events(),
            max_retries: default_max_retries(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            base_retry_delay_secs: default_base_retry_delay(),
            max_retry_delay_secs: default_max_retry_delay(),
            retry_jitter_factor: default_retry_jitter_factor(),
            lease_timeout_secs: default_lease_timeout(),
            reclaim_interval_secs: default_reclaim_interval(),
            worker_id: None,
            retry_seed: None,
        }
    }
}

/// Upper bound on every duration option: one year
const MAX_DURATION_SECS: f64 = 365.0 * 24.0 * 60.0 * 60.0;

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value > 0.0 && value <= MAX_DURATION_SECS {
        Ok(())
    } else {
        Err(ConfigError::invalid(
            field,
            format!("must be greater than 0 and at most {MAX_DURATION_SECS} seconds, got {value}"),
        ))
    }
}

fn non_negative(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=MAX_DURATION_SECS).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::invalid(
            field,
            format!("must be between 0 and {MAX_DURATION_SECS} seconds, got {value}"),
        ))
    }
}

impl QueueConfig {
    /// Check every option against its allowed range
    ///
    /// # Errors
    /// The first option found out of range
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_workers == 0 {
            return Err(ConfigError::invalid("num_workers", "must be at least 1"));
        }

        if self.batch_size == 0 {
            return Err(ConfigError::invalid("batch_size", "must be at least 1"));
        }

        positive("poll_interval_secs", self.poll_interval_secs)?;
        non_negative("shutdown_timeout_secs", self.shutdown_timeout_secs)?;
        non_negative("base_retry_delay_secs", self.base_retry_delay_secs)?;
        non_negative("max_retry_delay_secs", self.max_retry_delay_secs)?;
        positive("lease_timeout_secs", self.lease_timeout_secs)?;
        positive("reclaim_interval_secs", self.reclaim_interval_secs)?;

        if self.max_retry_delay_secs < self.base_retry_delay_secs {
            return Err(ConfigError::invalid(
                "max_retry_delay_secs",
                format!(
                    "must not be less than base_retry_delay_secs ({})",
                    self.base_retry_delay_secs
                ),
            ));
        }

        if !(0.0..1.0).contains(&self.retry_jitter_factor) {
            return Err(ConfigError::invalid(
                "retry_jitter_factor",
                format!("must be in [0, 1), got {}", self.retry_jitter_factor),
            ));
        }

        if self
            .worker_id
            .as_deref()
            .is_some_and(|id| id.trim().is_empty())
        {
            return Err(ConfigError::invalid("worker_id", "must not be blank"));
        }

        Ok(())
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_secs)
    }

    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.shutdown_timeout_secs)
    }

    #[must_use]
    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.lease_timeout_secs)
    }

    #[must_use]
    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_secs_f64(self.reclaim_interval_secs)
    }

    /// The retry policy described by this configuration
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_secs_f64(self.base_retry_delay_secs),
            max_delay: Duration::from_secs_f64(self.max_retry_delay_secs),
            jitter_factor: self.retry_jitter_factor,
        }
    }
}
