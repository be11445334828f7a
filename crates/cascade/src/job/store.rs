//! Durable job records.
//!
//! Snapshots are plain values; every write that matters for the
//! single-writer rule goes through a [`Lease`] and fails with
//! [`JobError::LeaseLost`] once someone else holds the row.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

use crate::clock::{chrono_duration, format_timestamp, parse_timestamp, Clock};
use crate::db::job_repo::{self, JobFilter, JobRow};
use crate::db::unit_repo::{self, CheckpointRow};
use crate::db::Database;
use crate::error::JobError;
use crate::job::record::{
    DimensionStatus, FailureKind, JobRecord, JobSpec, JobStatus, NewJob, Progress, UnitFailure,
};
use crate::unit::{Dimension, UnitKey};

/// Proof of write access to one job row.
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Completed sub-step outputs of an interrupted unit.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Checkpoint {
    pub next_step: usize,
    pub outputs: BTreeMap<String, serde_json::Value>,
}

// ─── Row conversion ─────────────────────────────────────────────────────────

/// Parses a cached JSON column, falling back to the default if it is
/// damaged. These columns are advisory, so a bad value is logged and
/// rebuilt rather than failing the job.
fn parse_cached<T: DeserializeOwned + Default>(raw: &str, column: &str, job_id: &str) -> T {
    serde_json::from_str(raw).unwrap_or_else(|e| {
        log::warn!(
            "Job {}: unreadable {} column ({}), using default",
            job_id,
            column,
            e
        );
        T::default()
    })
}

fn to_json<T: serde::Serialize>(value: &T, job_id: &str) -> Result<String, JobError> {
    serde_json::to_string(value).map_err(|e| JobError::Corrupt {
        id: job_id.to_string(),
        reason: e.to_string(),
    })
}

fn from_row(row: JobRow) -> Result<JobRecord, JobError> {
    let corrupt = |reason: String| JobError::Corrupt {
        id: row.id.clone(),
        reason,
    };

    let status: JobStatus = row.status.parse().map_err(corrupt)?;
    let spec: JobSpec =
        serde_json::from_str(&row.spec).map_err(|e| corrupt(format!("spec: {}", e)))?;
    let work_queue: Vec<Dimension> = serde_json::from_str(&row.work_queue)
        .map_err(|e| corrupt(format!("work_queue: {}", e)))?;

    let resume_pointer = row.resume_pointer.as_deref().and_then(|p| match p.parse() {
        Ok(pointer) => Some(pointer),
        Err(e) => {
            log::warn!("Job {}: dropping resume pointer: {}", row.id, e);
            None
        }
    });

    Ok(JobRecord {
        spec,
        status,
        work_queue,
        completed_dimensions: parse_cached(&row.completed_dimensions, "completed_dimensions", &row.id),
        dimension_status: parse_cached(&row.dimension_status, "dimension_status", &row.id),
        resume_pointer,
        progress: parse_cached(&row.progress, "progress", &row.id),
        error: row.error,
        link_cursor: row.link_cursor,
        linked_at: row.linked_at.as_deref().map(parse_timestamp),
        lease_expires_at: row.lease_expires_at.as_deref().map(parse_timestamp),
        created_at: parse_timestamp(&row.created_at),
        updated_at: parse_timestamp(&row.updated_at),
        id: row.id,
    })
}

fn to_row(job: &JobRecord, lease_token: Option<&str>) -> Result<JobRow, JobError> {
    Ok(JobRow {
        id: job.id.clone(),
        pipeline: job.spec.pipeline.clone(),
        scope_id: job.spec.scope_id.clone(),
        spec: to_json(&job.spec, &job.id)?,
        status: job.status.as_str().to_string(),
        work_queue: to_json(&job.work_queue, &job.id)?,
        completed_dimensions: to_json(&job.completed_dimensions, &job.id)?,
        dimension_status: to_json(&job.dimension_status, &job.id)?,
        resume_pointer: job.resume_pointer.as_ref().map(|p| p.to_string()),
        progress: to_json(&job.progress, &job.id)?,
        error: job.error.clone(),
        link_cursor: job.link_cursor.clone(),
        linked_at: job.linked_at.map(format_timestamp),
        lease_token: lease_token.map(String::from),
        lease_expires_at: lease_token.and(job.lease_expires_at.map(format_timestamp)),
        created_at: format_timestamp(job.created_at),
        updated_at: format_timestamp(job.updated_at),
    })
}

// ─── JobRecordStore ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct JobRecordStore {
    db: Database,
    clock: Arc<dyn Clock>,
}

impl JobRecordStore {
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Creates a `pending` job.
    pub fn create(&self, request: &NewJob) -> Result<JobRecord, JobError> {
        let work_queue = request.work_queue()?;
        let now = self.clock.now();
        let dimension_status = work_queue
            .iter()
            .map(|d| (d.clone(), DimensionStatus::NotStarted))
            .collect();

        let job = JobRecord {
            id: uuid::Uuid::new_v4().to_string(),
            spec: request.spec.clone(),
            status: JobStatus::Pending,
            work_queue,
            completed_dimensions: Vec::new(),
            dimension_status,
            resume_pointer: None,
            progress: Progress {
                message: "Job created".to_string(),
                timestamp: now,
                ..Default::default()
            },
            error: None,
            link_cursor: None,
            linked_at: None,
            lease_expires_at: None,
            created_at: now,
            updated_at: now,
        };

        job_repo::insert(&self.db, &to_row(&job, None)?)?;
        log::info!(
            "Created job {} ({} over {} dimension(s))",
            job.id,
            job.spec.pipeline,
            job.work_queue.len()
        );
        Ok(job)
    }

    pub fn get(&self, id: &str) -> Result<Option<JobRecord>, JobError> {
        job_repo::find_by_id(&self.db, id)?.map(from_row).transpose()
    }

    pub fn require(&self, id: &str) -> Result<JobRecord, JobError> {
        self.get(id)?
            .ok_or_else(|| JobError::NotFound(id.to_string()))
    }

    /// Lists jobs, newest first, returning `(jobs, total)`.
    pub fn list(
        &self,
        status: Option<JobStatus>,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<(Vec<JobRecord>, u64), JobError> {
        let filter = JobFilter {
            status: status.map(|s| s.as_str().to_string()),
            limit,
            offset,
            ..Default::default()
        };
        let (rows, total) = job_repo::query(&self.db, &filter)?;
        let jobs = rows.into_iter().map(from_row).collect::<Result<Vec<_>, _>>()?;
        Ok((jobs, total))
    }

    pub fn count(&self, status: JobStatus) -> Result<u64, JobError> {
        Ok(job_repo::count_by_status(&self.db, status.as_str())?)
    }

    /// Tries to take the job's lease, moving it to `running`.
    ///
    /// Succeeds only if the row is still in the status `job` was read with
    /// and no unexpired lease exists. On success `job` is updated in place.
    pub fn try_acquire(
        &self,
        job: &mut JobRecord,
        ttl: Duration,
    ) -> Result<Option<Lease>, JobError> {
        if !job.status.can_transition_to(JobStatus::Running) {
            return Err(JobError::InvalidTransition {
                id: job.id.clone(),
                from: job.status,
                to: JobStatus::Running,
            });
        }

        let now = self.clock.now();
        let lease = Lease {
            token: uuid::Uuid::new_v4().to_string(),
            expires_at: now + chrono_duration(ttl),
        };
        let acquired = job_repo::acquire_lease(
            &self.db,
            &job.id,
            job.status.as_str(),
            &lease.token,
            &format_timestamp(lease.expires_at),
            &format_timestamp(now),
        )?;
        if !acquired {
            return Ok(None);
        }

        job.status = JobStatus::Running;
        job.lease_expires_at = Some(lease.expires_at);
        job.updated_at = now;
        log::debug!("Job {}: lease acquired until {}", job.id, lease.expires_at);
        Ok(Some(lease))
    }

    /// Persists `job` and renews the lease.
    pub fn save(&self, job: &mut JobRecord, lease: &mut Lease, ttl: Duration) -> Result<(), JobError> {
        let now = self.clock.now();
        lease.expires_at = now + chrono_duration(ttl);
        job.lease_expires_at = Some(lease.expires_at);
        job.updated_at = now;

        let row = to_row(job, Some(&lease.token))?;
        if !job_repo::update_leased(&self.db, &row, &lease.token)? {
            return Err(JobError::LeaseLost { id: job.id.clone() });
        }
        Ok(())
    }

    /// Persists `job` and gives the lease up.
    pub fn release(&self, job: &mut JobRecord, lease: Lease) -> Result<(), JobError> {
        job.updated_at = self.clock.now();
        job.lease_expires_at = None;

        let row = to_row(job, None)?;
        if !job_repo::update_leased(&self.db, &row, &lease.token)? {
            return Err(JobError::LeaseLost { id: job.id.clone() });
        }
        Ok(())
    }

    /// Resets an abandoned `running` job to `stalled`. Returns false if the
    /// job turned out not to be stale (someone renewed it meanwhile).
    pub fn reset_stale(
        &self,
        job_id: &str,
        threshold: Duration,
        reason: &str,
    ) -> Result<bool, JobError> {
        let now = self.clock.now();
        let cutoff = now - chrono_duration(threshold);
        let reset = job_repo::reset_stale(
            &self.db,
            job_id,
            JobStatus::Stalled.as_str(),
            reason,
            &format_timestamp(now),
            &format_timestamp(cutoff),
        )?;
        if reset {
            log::warn!("Job {}: stale lock reset ({})", job_id, reason);
        }
        Ok(reset)
    }

    /// Fails a job on operator request. Terminal jobs are left alone.
    pub fn abort(&self, job_id: &str, reason: &str) -> Result<JobRecord, JobError> {
        let job = self.require(job_id)?;
        if job.status.is_terminal() {
            return Err(JobError::InvalidTransition {
                id: job.id,
                from: job.status,
                to: JobStatus::Failed,
            });
        }

        let now = format_timestamp(self.clock.now());
        if !job_repo::abort(&self.db, job_id, reason, &now)? {
            // Reached a terminal state between the read and the write.
            let current = self.require(job_id)?;
            return Err(JobError::InvalidTransition {
                id: current.id,
                from: current.status,
                to: JobStatus::Failed,
            });
        }
        log::info!("Job {} aborted: {}", job_id, reason);
        self.require(job_id)
    }

    /// Writes the recomputed dimension cache without touching `updated_at`.
    pub fn update_dimensions(&self, job: &JobRecord) -> Result<(), JobError> {
        job_repo::update_dimensions(
            &self.db,
            &job.id,
            &to_json(&job.completed_dimensions, &job.id)?,
            &to_json(&job.dimension_status, &job.id)?,
        )?;
        Ok(())
    }

    /// `running` jobs whose lease (or last update) is older than allowed.
    pub fn stale_running(&self, threshold: Duration) -> Result<Vec<JobRecord>, JobError> {
        let now = self.clock.now();
        let rows = job_repo::find_stale_running(
            &self.db,
            &format_timestamp(now),
            &format_timestamp(now - chrono_duration(threshold)),
        )?;
        rows.into_iter().map(from_row).collect()
    }

    /// Jobs in `status` untouched for at least `idle_for`.
    pub fn idle(&self, status: JobStatus, idle_for: Duration) -> Result<Vec<JobRecord>, JobError> {
        let cutoff = self.clock.now() - chrono_duration(idle_for);
        let rows = job_repo::find_idle(&self.db, status.as_str(), &format_timestamp(cutoff))?;
        rows.into_iter().map(from_row).collect()
    }

    // ─── Failure ledger ─────────────────────────────────────────────────────

    /// Records a unit failure and returns how many times it has failed.
    pub fn record_failure(
        &self,
        job_id: &str,
        key: &UnitKey,
        kind: FailureKind,
        error: &str,
    ) -> Result<u32, JobError> {
        let attempts = unit_repo::record_failure(
            &self.db,
            job_id,
            &key.parent_content_id,
            key.dimension.as_str(),
            &key.sub_type,
            kind.as_str(),
            error,
            &format_timestamp(self.clock.now()),
        )?;
        Ok(u32::try_from(attempts).unwrap_or(u32::MAX))
    }

    pub fn failures(&self, job_id: &str) -> Result<Vec<UnitFailure>, JobError> {
        Ok(unit_repo::list_failures(&self.db, job_id)?
            .into_iter()
            .map(|row| UnitFailure {
                key: UnitKey::new(row.parent_content_id, row.dimension, row.sub_type),
                kind: FailureKind::parse(&row.kind),
                attempts: u32::try_from(row.attempts).unwrap_or(0),
                error: row.last_error,
            })
            .collect())
    }

    pub fn clear_failure(&self, job_id: &str, key: &UnitKey) -> Result<(), JobError> {
        unit_repo::clear_failure(
            &self.db,
            job_id,
            &key.parent_content_id,
            key.dimension.as_str(),
            &key.sub_type,
        )?;
        Ok(())
    }

    pub fn clear_failures(&self, job_id: &str, kind: Option<FailureKind>) -> Result<usize, JobError> {
        Ok(unit_repo::clear_failures(
            &self.db,
            job_id,
            kind.as_ref().map(FailureKind::as_str),
        )?)
    }

    /// Units that failed at least `max_failures` times. These are left out
    /// of automatic planning.
    pub fn exhausted_units(
        &self,
        job_id: &str,
        max_failures: u32,
    ) -> Result<HashSet<UnitKey>, JobError> {
        Ok(self
            .failures(job_id)?
            .into_iter()
            .filter(|f| f.kind == FailureKind::Failed && f.attempts >= max_failures)
            .map(|f| f.key)
            .collect())
    }

    // ─── Sub-step checkpoints ───────────────────────────────────────────────

    pub fn save_checkpoint(
        &self,
        job_id: &str,
        key: &UnitKey,
        checkpoint: &Checkpoint,
    ) -> Result<(), JobError> {
        unit_repo::save_checkpoint(
            &self.db,
            &CheckpointRow {
                job_id: job_id.to_string(),
                parent_content_id: key.parent_content_id.clone(),
                dimension: key.dimension.to_string(),
                sub_type: key.sub_type.clone(),
                next_step: i64::try_from(checkpoint.next_step).unwrap_or(i64::MAX),
                outputs: to_json(&checkpoint.outputs, job_id)?,
                updated_at: format_timestamp(self.clock.now()),
            },
        )?;
        Ok(())
    }

    pub fn load_checkpoint(&self, job_id: &str, key: &UnitKey) -> Result<Option<Checkpoint>, JobError> {
        let row = unit_repo::load_checkpoint(
            &self.db,
            job_id,
            &key.parent_content_id,
            key.dimension.as_str(),
            &key.sub_type,
        )?;
        Ok(row.map(|row| Checkpoint {
            next_step: usize::try_from(row.next_step).unwrap_or(0),
            outputs: parse_cached(&row.outputs, "checkpoint outputs", job_id),
        }))
    }

    pub fn delete_checkpoint(&self, job_id: &str, key: &UnitKey) -> Result<(), JobError> {
        unit_repo::delete_checkpoint(
            &self.db,
            job_id,
            &key.parent_content_id,
            key.dimension.as_str(),
            &key.sub_type,
        )?;
        Ok(())
    }
}
