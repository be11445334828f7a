//! Job record types.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::chrono_duration;
use crate::error::JobError;
use crate::store::SourceScope;
use crate::unit::{Dimension, UnitKey};

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Partial,
    Stalled,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Partial => "partial",
            JobStatus::Stalled => "stalled",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether a job in this state may be moved to `to`.
    ///
    /// Staying in the same state is always allowed except for terminal
    /// states, which never change.
    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        match (self, to) {
            (Completed, _) | (Failed, _) => false,
            (a, b) if *a == b => true,
            (Pending, Running) | (Pending, Failed) => true,
            (Running, Partial) | (Running, Stalled) | (Running, Completed) | (Running, Failed) => {
                true
            }
            (Partial, Running) | (Partial, Failed) => true,
            (Stalled, Running) | (Stalled, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "partial" => Ok(JobStatus::Partial),
            "stalled" => Ok(JobStatus::Stalled),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DimensionStatus {
    NotStarted,
    Running,
    Partial,
    Completed,
}

/// What a job produces and from where.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Pipeline name, e.g. `cluster_translation`. Selects the collaborator's
    /// sub-steps.
    pub pipeline: String,
    pub scope_id: String,
    /// Dimension the source units live in.
    pub source_dimension: Dimension,
    #[serde(default)]
    pub sub_types: Vec<String>,
    /// When set, every produced unit must link back to the sibling of this
    /// sub-type in its own dimension before it can be written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_sub_type: Option<String>,
}

impl JobSpec {
    pub fn source_scope(&self) -> SourceScope {
        SourceScope {
            scope_id: self.scope_id.clone(),
            dimension: self.source_dimension.clone(),
            sub_types: self.sub_types.clone(),
        }
    }
}

/// A request to create a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    #[serde(flatten)]
    pub spec: JobSpec,
    pub dimensions: Vec<Dimension>,
}

impl NewJob {
    /// Validates the request and returns the work queue: requested
    /// dimensions in order, without duplicates or the source dimension.
    pub fn work_queue(&self) -> Result<Vec<Dimension>, JobError> {
        if self.spec.pipeline.trim().is_empty() {
            return Err(JobError::InvalidRequest("pipeline is required".to_string()));
        }
        if self.spec.scope_id.trim().is_empty() {
            return Err(JobError::InvalidRequest("scope_id is required".to_string()));
        }
        if self.spec.source_dimension.as_str().is_empty() {
            return Err(JobError::InvalidRequest(
                "source_dimension is required".to_string(),
            ));
        }

        let mut queue: Vec<Dimension> = Vec::with_capacity(self.dimensions.len());
        for dim in &self.dimensions {
            if dim.as_str().is_empty() || dim.as_str().contains(':') {
                return Err(JobError::InvalidRequest(format!(
                    "invalid dimension '{}'",
                    dim
                )));
            }
            if *dim == self.spec.source_dimension || queue.contains(dim) {
                continue;
            }
            queue.push(dim.clone());
        }

        if queue.is_empty() {
            return Err(JobError::InvalidRequest(
                "at least one target dimension other than the source is required".to_string(),
            ));
        }
        Ok(queue)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Failed,
    Blocked,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Failed => "failed",
            FailureKind::Blocked => "blocked",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "blocked" => FailureKind::Blocked,
            _ => FailureKind::Failed,
        }
    }
}

/// One entry in the per-unit error list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitFailure {
    pub key: UnitKey,
    pub kind: FailureKind,
    pub attempts: u32,
    pub error: String,
}

/// UI-facing progress. Advisory only; nothing reads it back for planning.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub message: String,
    pub current_count: u64,
    pub expected_count: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_dimension: Option<Dimension>,
    /// Units written across all invocations of the job.
    #[serde(default)]
    pub processed_total: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<UnitFailure>,
}

/// Where inside a unit to resume: `dimension:step:parent_content_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResumePointer {
    pub dimension: Dimension,
    /// Index of the next sub-step to run.
    pub step: usize,
    pub parent_content_id: String,
}

impl ResumePointer {
    pub fn new(dimension: Dimension, step: usize, parent_content_id: impl Into<String>) -> Self {
        Self {
            dimension,
            step,
            parent_content_id: parent_content_id.into(),
        }
    }
}

impl fmt::Display for ResumePointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.dimension, self.step, self.parent_content_id)
    }
}

impl FromStr for ResumePointer {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || JobError::InvalidResumePointer(s.to_string());
        let mut parts = s.splitn(3, ':');
        let dimension = parts.next().filter(|p| !p.is_empty()).ok_or_else(invalid)?;
        let step = parts
            .next()
            .and_then(|p| p.parse::<usize>().ok())
            .ok_or_else(invalid)?;
        let parent = parts.next().filter(|p| !p.is_empty()).ok_or_else(invalid)?;
        Ok(Self::new(Dimension::new(dimension), step, parent))
    }
}

impl TryFrom<String> for ResumePointer {
    type Error = JobError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ResumePointer> for String {
    fn from(p: ResumePointer) -> Self {
        p.to_string()
    }
}

/// Snapshot of a job. The lease token itself never leaves the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub spec: JobSpec,
    pub status: JobStatus,
    pub work_queue: Vec<Dimension>,
    pub completed_dimensions: Vec<Dimension>,
    pub dimension_status: BTreeMap<Dimension, DimensionStatus>,
    pub resume_pointer: Option<ResumePointer>,
    pub progress: Progress,
    pub error: Option<String>,
    /// Last group the linking pass finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_cursor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Moves the job to `to`, refusing anything the lifecycle forbids.
    pub fn transition(&mut self, to: JobStatus) -> Result<(), JobError> {
        if !self.status.can_transition_to(to) {
            return Err(JobError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// A `running` job is stale once its lease has expired, or, for rows
    /// without a lease, once it has not been updated for `threshold`.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: std::time::Duration) -> bool {
        if self.status != JobStatus::Running {
            return false;
        }
        match self.lease_expires_at {
            Some(expires) => expires <= now,
            None => self.updated_at + chrono_duration(threshold) <= now,
        }
    }

    /// Dimensions from the work queue not yet marked complete, in queue
    /// order.
    pub fn open_dimensions(&self) -> Vec<Dimension> {
        self.work_queue
            .iter()
            .filter(|d| !self.completed_dimensions.contains(d))
            .cloned()
            .collect()
    }
}
