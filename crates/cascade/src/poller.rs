//! Client-side job status polling.
//!
//! Polls fast while a job is young and slower afterwards, flags `running`
//! jobs whose lease has lapsed as possibly stuck, and stops on a terminal
//! status.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;

use crate::clock::{Clock, SystemClock};
use crate::config::schema::PollerConfig;
use crate::job::JobRecord;
use crate::sanitize::redact_url;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PollError {
    #[error("Job '{0}' not found")]
    NotFound(String),

    #[error("Status request failed: {0}")]
    Http(String),

    #[error("Status endpoint returned HTTP {status}")]
    Status { status: u16 },

    #[error("Unreadable status response: {0}")]
    Decode(String),

    #[error("Gave up after {errors} consecutive errors, last: {last}")]
    GaveUp { errors: u32, last: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    pub fast: Duration,
    pub fast_window: Duration,
    pub slow: Duration,
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self::from_config(&PollerConfig::default())
    }
}

impl PollSchedule {
    pub fn from_config(config: &PollerConfig) -> Self {
        Self {
            fast: Duration::from_millis(config.fast_interval_ms),
            fast_window: Duration::from_secs(config.fast_window_secs),
            slow: Duration::from_millis(config.slow_interval_ms),
        }
    }

    /// Delay before the next poll, `elapsed` after polling started.
    pub fn interval_at(&self, elapsed: Duration) -> Duration {
        if elapsed < self.fast_window {
            self.fast
        } else {
            self.slow
        }
    }
}

#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn fetch(&self, job_id: &str) -> Result<JobRecord, PollError>;
}

/// `GET {base}/jobs/{id}` against the server.
pub struct HttpStatusSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpStatusSource {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl StatusSource for HttpStatusSource {
    async fn fetch(&self, job_id: &str) -> Result<JobRecord, PollError> {
        let url = format!("{}/jobs/{}", self.base_url, job_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| PollError::Http(format!("{}: {}", redact_url(&url), e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(PollError::NotFound(job_id.to_string()));
        }
        if !status.is_success() {
            return Err(PollError::Status {
                status: status.as_u16(),
            });
        }
        response
            .json::<JobRecord>()
            .await
            .map_err(|e| PollError::Decode(e.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct PollUpdate {
    pub snapshot: JobRecord,
    /// `running`, but nothing has renewed the lease within the threshold.
    pub possibly_stuck: bool,
    pub elapsed: Duration,
}

pub struct JobPoller {
    source: Arc<dyn StatusSource>,
    schedule: PollSchedule,
    staleness_threshold: Duration,
    max_consecutive_errors: u32,
    clock: Arc<dyn Clock>,
}

impl JobPoller {
    pub fn new(source: Arc<dyn StatusSource>, staleness_threshold: Duration) -> Self {
        let defaults = PollerConfig::default();
        Self {
            source,
            schedule: PollSchedule::from_config(&defaults),
            staleness_threshold,
            max_consecutive_errors: defaults.max_consecutive_errors,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_config(mut self, config: &PollerConfig) -> Self {
        self.schedule = PollSchedule::from_config(config);
        self.max_consecutive_errors = config.max_consecutive_errors.max(1);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Polls until the job is terminal, calling `on_update` for every
    /// snapshot. Returns the terminal snapshot.
    ///
    /// A missing job ends polling immediately; other errors are tolerated
    /// until `max_consecutive_errors` happen in a row.
    pub async fn run<F>(&self, job_id: &str, mut on_update: F) -> Result<JobRecord, PollError>
    where
        F: FnMut(&PollUpdate),
    {
        let started = Instant::now();
        let mut errors = 0u32;

        loop {
            let elapsed = started.elapsed();
            match self.source.fetch(job_id).await {
                Ok(snapshot) => {
                    errors = 0;
                    let possibly_stuck =
                        snapshot.is_stale(self.clock.now(), self.staleness_threshold);
                    if possibly_stuck {
                        log::warn!(
                            "Job {} looks stuck: running but not updated since {}",
                            job_id,
                            snapshot.updated_at
                        );
                    }
                    let terminal = snapshot.status.is_terminal();
                    let update = PollUpdate {
                        snapshot,
                        possibly_stuck,
                        elapsed,
                    };
                    on_update(&update);
                    if terminal {
                        return Ok(update.snapshot);
                    }
                }
                Err(e @ PollError::NotFound(_)) => return Err(e),
                Err(e) => {
                    errors += 1;
                    log::warn!("Polling job {} failed ({}/{}): {}", job_id, errors, self.max_consecutive_errors, e);
                    if errors >= self.max_consecutive_errors {
                        return Err(PollError::GaveUp {
                            errors,
                            last: e.to_string(),
                        });
                    }
                }
            }
            tokio::time::sleep(self.schedule.interval_at(started.elapsed())).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::job::{JobSpec, JobStatus, Progress};
    use crate::unit::Dimension;
    use chrono::Utc;
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::Mutex;

    struct Scripted {
        replies: Mutex<VecDeque<Result<JobRecord, PollError>>>,
    }

    #[async_trait]
    impl StatusSource for Scripted {
        async fn fetch(&self, _job_id: &str) -> Result<JobRecord, PollError> {
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(PollError::Http("script exhausted".to_string())))
        }
    }

    fn snapshot(status: JobStatus, lease_expired: bool) -> JobRecord {
        let now = Utc::now();
        JobRecord {
            id: "job-1".to_string(),
            spec: JobSpec {
                pipeline: "cluster_translation".to_string(),
                scope_id: "c1".to_string(),
                source_dimension: Dimension::new("en"),
                sub_types: vec![],
                link_sub_type: None,
            },
            status,
            work_queue: vec![Dimension::new("de")],
            completed_dimensions: vec![],
            dimension_status: BTreeMap::new(),
            resume_pointer: None,
            progress: Progress::default(),
            error: None,
            link_cursor: None,
            linked_at: None,
            lease_expires_at: Some(if lease_expired {
                now - chrono::Duration::minutes(1)
            } else {
                now + chrono::Duration::minutes(9)
            }),
            created_at: now,
            updated_at: now,
        }
    }

    fn poller(replies: Vec<Result<JobRecord, PollError>>) -> JobPoller {
        let source = Arc::new(Scripted {
            replies: Mutex::new(replies.into()),
        });
        JobPoller::new(source, Duration::from_secs(600))
            .with_clock(Arc::new(ManualClock::new(Utc::now())))
    }

    #[test]
    fn test_schedule_slows_down_after_window() {
        let schedule = PollSchedule::default();
        assert_eq!(schedule.interval_at(Duration::ZERO), Duration::from_secs(3));
        assert_eq!(schedule.interval_at(Duration::from_secs(119)), Duration::from_secs(3));
        assert_eq!(schedule.interval_at(Duration::from_secs(120)), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_on_terminal_status() {
        let p = poller(vec![
            Ok(snapshot(JobStatus::Running, false)),
            Err(PollError::Status { status: 502 }),
            Ok(snapshot(JobStatus::Partial, false)),
            Ok(snapshot(JobStatus::Completed, false)),
        ]);
        let mut seen = Vec::new();
        let last = p
            .run("job-1", |u| seen.push((u.snapshot.status, u.possibly_stuck)))
            .await
            .unwrap();

        assert_eq!(last.status, JobStatus::Completed);
        assert_eq!(
            seen,
            vec![
                (JobStatus::Running, false),
                (JobStatus::Partial, false),
                (JobStatus::Completed, false)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_flags_expired_lease_as_possibly_stuck() {
        let p = poller(vec![
            Ok(snapshot(JobStatus::Running, true)),
            Ok(snapshot(JobStatus::Failed, false)),
        ]);
        let mut stuck = Vec::new();
        p.run("job-1", |u| stuck.push(u.possibly_stuck)).await.unwrap();
        assert_eq!(stuck, vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_consecutive_errors() {
        let p = poller(vec![]).with_config(&PollerConfig {
            max_consecutive_errors: 2,
            ..Default::default()
        });
        let err = p.run("job-1", |_| {}).await.unwrap_err();
        assert!(matches!(err, PollError::GaveUp { errors: 2, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_job_ends_immediately() {
        let p = poller(vec![Err(PollError::NotFound("job-1".to_string()))]);
        let err = p.run("job-1", |_| {}).await.unwrap_err();
        assert_eq!(err, PollError::NotFound("job-1".to_string()));
    }
}
