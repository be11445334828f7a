//! Self-continuation triggers.
//!
//! A trigger hands the job to a fresh invocation. Failing to fire is logged
//! and never fails the current invocation: the job record is the durable
//! intent, and the sweeper picks up anything that was dropped.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;

use crate::db::DatabaseError;
use crate::job::ResumePointer;
use crate::queue::ContinuationQueue;
use crate::sanitize::redact_url;

#[derive(Error, Debug)]
pub enum TriggerError {
    #[error("Failed to queue continuation: {0}")]
    Queue(#[from] DatabaseError),

    #[error("Failed to send continuation request: {0}")]
    Http(String),
}

#[async_trait]
pub trait ContinuationTrigger: Send + Sync {
    async fn fire(&self, job_id: &str, pointer: Option<&ResumePointer>)
        -> Result<(), TriggerError>;
}

/// Enqueues a continuation row for the worker pool, and optionally wakes it.
pub struct QueueTrigger {
    queue: ContinuationQueue,
    waker: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl QueueTrigger {
    pub fn new(queue: ContinuationQueue) -> Self {
        Self { queue, waker: None }
    }

    pub fn with_waker(mut self, waker: Arc<dyn Fn() + Send + Sync>) -> Self {
        self.waker = Some(waker);
        self
    }
}

#[async_trait]
impl ContinuationTrigger for QueueTrigger {
    async fn fire(
        &self,
        job_id: &str,
        pointer: Option<&ResumePointer>,
    ) -> Result<(), TriggerError> {
        self.queue.enqueue(job_id, pointer)?;
        if let Some(wake) = &self.waker {
            wake();
        }
        Ok(())
    }
}

/// Fire-and-forget POST to the orchestration endpoint.
///
/// The request is spawned and not awaited; only failure to build it is
/// reported. Delivery failures are logged by the spawned task.
pub struct HttpTrigger {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTrigger {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }

    /// `POST {base}/orchestrate`.
    pub fn for_base_url(base: &str) -> Self {
        Self::new(format!("{}/orchestrate", base.trim_end_matches('/')))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ContinuationTrigger for HttpTrigger {
    async fn fire(
        &self,
        job_id: &str,
        pointer: Option<&ResumePointer>,
    ) -> Result<(), TriggerError> {
        let body = json!({
            "job_id": job_id,
            "resume_pointer": pointer.map(|p| p.to_string()),
        });
        let request = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .build()
            .map_err(|e| TriggerError::Http(e.to_string()))?;

        let client = self.client.clone();
        let endpoint = redact_url(&self.endpoint);
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            match client.execute(request).await {
                Ok(resp) if resp.status().is_success() => {
                    log::debug!("Continuation for job {} accepted by {}", job_id, endpoint);
                }
                Ok(resp) => log::error!(
                    "Continuation for job {} rejected by {}: HTTP {}",
                    job_id,
                    endpoint,
                    resp.status()
                ),
                Err(e) => log::error!(
                    "Continuation for job {} to {} failed: {}",
                    job_id,
                    endpoint,
                    e
                ),
            }
        });
        Ok(())
    }
}

/// For auto-continue disabled deployments and tests.
pub struct NoopTrigger;

#[async_trait]
impl ContinuationTrigger for NoopTrigger {
    async fn fire(&self, job_id: &str, _pointer: Option<&ResumePointer>) -> Result<(), TriggerError> {
        log::debug!("Continuation for job {} not fired (no trigger)", job_id);
        Ok(())
    }
}
