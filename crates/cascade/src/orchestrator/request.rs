//! Wire types of the orchestration entry point.

use serde::{Deserialize, Serialize};

use crate::job::{JobRecord, JobStatus, UnitFailure};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvokeRequest {
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_pointer: Option<String>,
    /// Restricts this invocation to one dimension of the work queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimension: Option<String>,
    /// Report what would be done without doing it.
    #[serde(default)]
    pub dry_run: bool,
    /// Forget previous per-unit failures before planning.
    #[serde(default)]
    pub retry_failed: bool,
}

impl InvokeRequest {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            ..Default::default()
        }
    }
}

/// Outcome status reported to callers: a job status, or `blocked`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Running,
    Partial,
    Stalled,
    Completed,
    Failed,
    Blocked,
}

impl From<JobStatus> for ResponseStatus {
    fn from(status: JobStatus) -> Self {
        match status {
            // Never run yet: all of its work remains.
            JobStatus::Pending => ResponseStatus::Partial,
            JobStatus::Running => ResponseStatus::Running,
            JobStatus::Partial => ResponseStatus::Partial,
            JobStatus::Stalled => ResponseStatus::Stalled,
            JobStatus::Completed => ResponseStatus::Completed,
            JobStatus::Failed => ResponseStatus::Failed,
        }
    }
}

/// Always delivered with HTTP 200; callers read `status`, not the
/// transport code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeResponse {
    pub success: bool,
    pub status: ResponseStatus,
    pub processed_count: u64,
    pub remaining_count: u64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing_prerequisites: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_pointer: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<UnitFailure>,
}

impl InvokeResponse {
    pub fn new(status: ResponseStatus, message: impl Into<String>) -> Self {
        Self {
            success: !matches!(status, ResponseStatus::Failed | ResponseStatus::Blocked),
            status,
            processed_count: 0,
            remaining_count: 0,
            message: message.into(),
            blocked_reason: None,
            missing_prerequisites: None,
            resume_pointer: None,
            failures: Vec::new(),
        }
    }

    /// Reports a job's recorded state without having done anything.
    pub fn snapshot(job: &JobRecord, message: impl Into<String>) -> Self {
        let mut response = Self::new(job.status.into(), message);
        response.remaining_count = job
            .progress
            .expected_count
            .saturating_sub(job.progress.current_count);
        response.resume_pointer = job.resume_pointer.as_ref().map(|p| p.to_string());
        response.failures = job.progress.failures.clone();
        response
    }

    pub fn blocked(reason: impl Into<String>, missing: Vec<String>) -> Self {
        let reason = reason.into();
        let mut response = Self::new(ResponseStatus::Blocked, reason.clone());
        response.blocked_reason = Some(reason);
        response.missing_prerequisites = Some(missing);
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults() {
        let req: InvokeRequest = serde_json::from_str(r#"{"job_id":"j1"}"#).unwrap();
        assert_eq!(req, InvokeRequest::new("j1"));
    }

    #[test]
    fn test_success_flag_follows_status() {
        assert!(InvokeResponse::new(ResponseStatus::Partial, "").success);
        assert!(InvokeResponse::new(ResponseStatus::Stalled, "").success);
        assert!(!InvokeResponse::new(ResponseStatus::Failed, "").success);

        let blocked = InvokeResponse::blocked("missing link", vec!["a1/de/article".to_string()]);
        assert!(!blocked.success);
        let json = serde_json::to_value(&blocked).unwrap();
        assert_eq!(json["status"], "blocked");
        assert_eq!(json["missing_prerequisites"][0], "a1/de/article");
        assert!(json.get("resume_pointer").is_none());
    }

    #[test]
    fn test_job_statuses_map_to_response_values() {
        let reported: Vec<String> = [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Partial,
            JobStatus::Stalled,
            JobStatus::Completed,
            JobStatus::Failed,
        ]
        .into_iter()
        .map(|s| serde_json::to_value(ResponseStatus::from(s)).unwrap())
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
        assert_eq!(
            reported,
            ["partial", "running", "partial", "stalled", "completed", "failed"]
        );
    }
}
