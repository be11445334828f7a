//! Job progress broadcaster for real-time status streaming.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::job::{JobRecord, JobStatus};
use crate::unit::Dimension;

/// Progress event for a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobProgressEvent {
    pub job_id: String,
    pub status: JobStatus,
    /// Human-readable message describing current activity.
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimension: Option<Dimension>,
    pub current_count: u64,
    pub expected_count: u64,
    pub timestamp: DateTime<Utc>,
    /// Set when the job failed or stopped on a blocking error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobProgressEvent {
    /// Snapshot of a job's current progress.
    pub fn from_job(job: &JobRecord) -> Self {
        Self {
            job_id: job.id.clone(),
            status: job.status,
            message: job.progress.message.clone(),
            dimension: job.progress.current_dimension.clone(),
            current_count: job.progress.current_count,
            expected_count: job.progress.expected_count,
            timestamp: job.progress.timestamp,
            error: job.error.clone(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Receives progress from the orchestrator.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: JobProgressEvent);
}

/// No-op reporter for unit tests.
pub struct NoopProgress;

impl ProgressReporter for NoopProgress {
    fn report(&self, _event: JobProgressEvent) {}
}

/// Broadcasts job progress events for streaming.
#[derive(Clone)]
pub struct JobProgressBroadcaster {
    sender: Arc<broadcast::Sender<JobProgressEvent>>,
}

impl JobProgressBroadcaster {
    /// Creates a new job progress broadcaster with the specified channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Sends a progress event to all subscribers.
    pub fn send(&self, event: JobProgressEvent) {
        // No active receivers is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobProgressEvent> {
        self.sender.subscribe()
    }
}

impl Default for JobProgressBroadcaster {
    fn default() -> Self {
        Self::new(100)
    }
}

impl ProgressReporter for JobProgressBroadcaster {
    fn report(&self, event: JobProgressEvent) {
        self.send(event);
    }
}
