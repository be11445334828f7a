//! Durable continuation queue.
//!
//! Replaces the fire-and-forget self-call as the handoff primitive: a
//! checkpointed invocation enqueues a continuation, and a worker claims it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::{chrono_duration, format_timestamp, parse_timestamp, Clock};
use crate::db::queue_repo::{self, ContinuationRow};
use crate::db::{Database, DatabaseError};
use crate::job::ResumePointer;

/// A claimed continuation.
#[derive(Debug, Clone, PartialEq)]
pub struct Continuation {
    pub id: i64,
    pub job_id: String,
    pub resume_pointer: Option<ResumePointer>,
    pub enqueued_at: DateTime<Utc>,
    /// Times this row was released back to the queue.
    pub attempts: u32,
}

impl From<ContinuationRow> for Continuation {
    fn from(row: ContinuationRow) -> Self {
        let resume_pointer = row.resume_pointer.as_deref().and_then(|p| match p.parse() {
            Ok(pointer) => Some(pointer),
            Err(e) => {
                log::warn!("Continuation {}: ignoring bad pointer: {}", row.id, e);
                None
            }
        });
        Self {
            id: row.id,
            job_id: row.job_id,
            resume_pointer,
            enqueued_at: parse_timestamp(&row.enqueued_at),
            attempts: u32::try_from(row.attempts).unwrap_or(0),
        }
    }
}

#[derive(Clone)]
pub struct ContinuationQueue {
    db: Database,
    clock: Arc<dyn Clock>,
}

impl ContinuationQueue {
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Queues a continuation for `job_id`. A job never has more than one
    /// waiting row; a second enqueue only replaces the pointer.
    pub fn enqueue(
        &self,
        job_id: &str,
        pointer: Option<&ResumePointer>,
    ) -> Result<i64, DatabaseError> {
        let pointer = pointer.map(|p| p.to_string());
        let id = queue_repo::enqueue(
            &self.db,
            job_id,
            pointer.as_deref(),
            &format_timestamp(self.clock.now()),
        )?;
        log::debug!("Queued continuation {} for job {}", id, job_id);
        Ok(id)
    }

    /// Claims the oldest available row for `worker` until `ttl` elapses.
    pub fn claim(&self, worker: &str, ttl: Duration) -> Result<Option<Continuation>, DatabaseError> {
        let now = self.clock.now();
        let row = queue_repo::claim(
            &self.db,
            worker,
            &format_timestamp(now),
            &format_timestamp(now + chrono_duration(ttl)),
        )?;
        Ok(row.map(Continuation::from))
    }

    pub fn complete(&self, id: i64) -> Result<(), DatabaseError> {
        queue_repo::complete(&self.db, id)
    }

    /// Puts a claimed row back for another worker.
    pub fn release(&self, id: i64) -> Result<(), DatabaseError> {
        queue_repo::release(&self.db, id)
    }

    pub fn has_pending(&self, job_id: &str) -> Result<bool, DatabaseError> {
        queue_repo::has_pending(&self.db, job_id)
    }

    pub fn len(&self) -> Result<u64, DatabaseError> {
        queue_repo::len(&self.db)
    }

    pub fn is_empty(&self) -> Result<bool, DatabaseError> {
        Ok(self.len()? == 0)
    }
}
