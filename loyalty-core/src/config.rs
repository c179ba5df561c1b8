//! Configuration for the reconciliation pipeline

use crate::backoff::BackoffPolicy;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What `submit` does when the queue is at capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackpressurePolicy {
    /// Fail fast with the retryable `QueueFull` error
    Reject,
    /// Wait until a slot frees up
    Block,
}

impl Default for BackpressurePolicy {
    fn default() -> Self {
        BackpressurePolicy::Reject
    }
}

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of reconciliation workers (>= 1)
    pub workers: usize,

    /// Bounded queue capacity
    pub queue_capacity: usize,

    /// Full-queue behaviour for submissions
    pub backpressure: BackpressurePolicy,

    /// Per-attempt timeout for the accrual lookup
    pub request_timeout_ms: u64,

    /// Accrual client retry policy (inner loop)
    pub backoff: BackoffPolicy,

    /// Delay before a task with an exhausted budget is re-enqueued (outer loop)
    pub requeue: BackoffPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
            backpressure: BackpressurePolicy::Reject,
            request_timeout_ms: 3_000,
            backoff: BackoffPolicy::default(),
            requeue: BackoffPolicy::requeue_default(),
        }
    }
}

impl PipelineConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Config("at least one worker is required".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(Error::Config("queue capacity must be positive".to_string()));
        }
        if self.request_timeout_ms == 0 {
            return Err(Error::Config("request timeout must be positive".to_string()));
        }
        if self.backoff.max_elapsed().is_none() {
            return Err(Error::Config(
                "accrual backoff needs a finite max elapsed time".to_string(),
            ));
        }
        self.backoff.validate()?;
        self.requeue.validate()?;
        Ok(())
    }
}
