//! Worker configuration

use anyhow::Result;
use std::time::Duration;

use crate::queue::RetryPolicy;

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Retry policy shared by both queues
    pub retry: RetryPolicy,
    /// How long a consumer blocks waiting for a job before re-checking for shutdown
    pub poll_interval: Duration,
}

impl WorkerConfig {
    /// Create a new WorkerConfig from environment variables
    ///
    /// # Environment Variables
    /// - `QUEUE_MAX_ATTEMPTS`: Deliveries before a job is dead-lettered (default: 3)
    /// - `QUEUE_BACKOFF_MS`: Delay before the first retry, doubled per attempt (default: 1000)
    /// - `QUEUE_POLL_SECONDS`: Blocking wait per reserve call, at least 1 (default: 5)
    pub fn from_env() -> Result<Self> {
        let max_attempts: u32 = std::env::var("QUEUE_MAX_ATTEMPTS")
            .unwrap_or_else(|_| "3".to_string())
            .parse()
            .unwrap_or(3);

        let backoff_ms = std::env::var("QUEUE_BACKOFF_MS")
            .unwrap_or_else(|_| "1000".to_string())
            .parse()
            .unwrap_or(1000);

        let poll_seconds: u64 = std::env::var("QUEUE_POLL_SECONDS")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .unwrap_or(5);

        if max_attempts == 0 {
            anyhow::bail!("QUEUE_MAX_ATTEMPTS must be at least 1");
        }

        // A zero wait turns every idle consumer into a busy loop
        if poll_seconds == 0 {
            anyhow::bail!("QUEUE_POLL_SECONDS must be at least 1");
        }

        Ok(WorkerConfig {
            retry: RetryPolicy {
                max_attempts,
                base_delay: Duration::from_millis(backoff_ms),
            },
            poll_interval: Duration::from_secs(poll_seconds),
        })
    }
}
