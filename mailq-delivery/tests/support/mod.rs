#![allow(dead_code)]

pub mod mock_transport;
pub mod recording_sink;

use std::time::Duration;

use mailq_delivery::QueueConfig;

/// A configuration that polls and retries on a millisecond scale.
pub fn fast_config() -> QueueConfig {
    QueueConfig {
        num_workers: 2,
        batch_size: 10,
        poll_interval_secs: 0.01,
        base_retry_delay_secs: 0.01,
        max_retry_delay_secs: 0.05,
        retry_jitter_factor: 0.0,
        shutdown_timeout_secs: 1.0,
        retry_seed: Some(7),
        ..QueueConfig::default()
    }
}

/// Upper bound for any single test to reach its expected state.
pub const SETTLE: Duration = Duration::from_secs(10);
