//! Stale-job sweeper.
//!
//! Recovers jobs whose continuation chain broke: an invocation that died
//! holding the lease, or a handoff that never arrived.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::error::CascadeError;
use crate::job::{JobRecordStore, JobStatus};
use crate::queue::ContinuationQueue;
use crate::trigger::ContinuationTrigger;

const STALE_REASON: &str = "Lock expired; invocation presumed dead (swept)";

/// What a sweep found and did. In a dry run nothing is changed and the
/// lists describe what would have been done.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub dry_run: bool,
    /// `running` jobs reset to `stalled`.
    pub stale_reset: Vec<String>,
    /// Jobs a continuation was fired for.
    pub requeued: Vec<String>,
    /// Jobs that already had a continuation waiting.
    pub skipped: Vec<String>,
    /// Jobs whose continuation could not be fired.
    pub failed: Vec<String>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.stale_reset.is_empty() && self.requeued.is_empty()
    }
}

pub struct Sweeper {
    jobs: JobRecordStore,
    trigger: Arc<dyn ContinuationTrigger>,
    /// Lets the sweep see continuations that are already waiting.
    queue: Option<ContinuationQueue>,
    threshold: Duration,
}

impl Sweeper {
    pub fn new(
        jobs: JobRecordStore,
        trigger: Arc<dyn ContinuationTrigger>,
        threshold: Duration,
    ) -> Self {
        Self {
            jobs,
            trigger,
            queue: None,
            threshold,
        }
    }

    pub fn with_queue(mut self, queue: ContinuationQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    pub async fn sweep(&self, dry_run: bool) -> Result<SweepReport, CascadeError> {
        let mut report = SweepReport {
            dry_run,
            ..Default::default()
        };

        for job in self.jobs.stale_running(self.threshold)? {
            if dry_run {
                report.stale_reset.push(job.id.clone());
                self.requeue(&job.id, true, &mut report).await?;
                continue;
            }
            // Someone may have renewed the lease since the query.
            if self.jobs.reset_stale(&job.id, self.threshold, STALE_REASON)? {
                report.stale_reset.push(job.id.clone());
                self.requeue(&job.id, false, &mut report).await?;
            }
        }

        for job in self.jobs.idle(JobStatus::Stalled, self.threshold)? {
            if report.stale_reset.contains(&job.id) {
                continue;
            }
            self.requeue(&job.id, dry_run, &mut report).await?;
        }

        if !report.is_empty() {
            log::info!(
                "Sweep{}: {} stale lock(s) reset, {} continuation(s) fired",
                if dry_run { " (dry run)" } else { "" },
                report.stale_reset.len(),
                report.requeued.len()
            );
        }
        Ok(report)
    }

    async fn requeue(
        &self,
        job_id: &str,
        dry_run: bool,
        report: &mut SweepReport,
    ) -> Result<(), CascadeError> {
        if let Some(queue) = &self.queue {
            if queue.has_pending(job_id)? {
                report.skipped.push(job_id.to_string());
                return Ok(());
            }
        }
        if !dry_run {
            if let Err(e) = self.trigger.fire(job_id, None).await {
                log::error!("Sweep: continuation for job {} failed: {}", job_id, e);
                report.failed.push(job_id.to_string());
                return Ok(());
            }
        }
        report.requeued.push(job_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::Database;
    use crate::job::{JobSpec, NewJob};
    use crate::trigger::QueueTrigger;
    use crate::unit::Dimension;
    use chrono::Utc;

    const TEN_MIN: Duration = Duration::from_secs(600);

    fn setup() -> (Sweeper, JobRecordStore, ContinuationQueue, Arc<ManualClock>) {
        let db = Database::open_in_memory().unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let jobs = JobRecordStore::new(db.clone(), clock.clone());
        let queue = ContinuationQueue::new(db, clock.clone());
        let trigger = Arc::new(QueueTrigger::new(queue.clone()));
        (
            Sweeper::new(jobs.clone(), trigger, TEN_MIN).with_queue(queue.clone()),
            jobs,
            queue,
            clock,
        )
    }

    fn new_job(jobs: &JobRecordStore) -> String {
        jobs.create(&NewJob {
            spec: JobSpec {
                pipeline: "cluster_translation".to_string(),
                scope_id: "cluster-1".to_string(),
                source_dimension: Dimension::new("en"),
                sub_types: vec![],
                link_sub_type: None,
            },
            dimensions: vec![Dimension::new("de")],
        })
        .unwrap()
        .id
    }

    #[tokio::test]
    async fn test_resets_expired_lease_and_queues() {
        let (sweeper, jobs, queue, clock) = setup();
        let id = new_job(&jobs);
        let mut job = jobs.require(&id).unwrap();
        jobs.try_acquire(&mut job, TEN_MIN).unwrap().unwrap();

        assert!(sweeper.sweep(false).await.unwrap().is_empty());

        clock.advance(TEN_MIN + Duration::from_secs(1));
        let report = sweeper.sweep(false).await.unwrap();
        assert_eq!(report.stale_reset, vec![id.clone()]);
        assert_eq!(report.requeued, vec![id.clone()]);

        let job = jobs.require(&id).unwrap();
        assert_eq!(job.status, JobStatus::Stalled);
        assert!(job.error.unwrap().contains("Lock expired"));
        assert!(queue.has_pending(&id).unwrap());

        // Second sweep: already queued.
        clock.advance(TEN_MIN);
        let report = sweeper.sweep(false).await.unwrap();
        assert_eq!(report.skipped, vec![id]);
        assert_eq!(queue.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dry_run_changes_nothing() {
        let (sweeper, jobs, queue, clock) = setup();
        let id = new_job(&jobs);
        let mut job = jobs.require(&id).unwrap();
        jobs.try_acquire(&mut job, TEN_MIN).unwrap().unwrap();
        clock.advance(TEN_MIN * 2);

        let report = sweeper.sweep(true).await.unwrap();
        assert!(report.dry_run);
        assert_eq!(report.stale_reset, vec![id.clone()]);
        assert_eq!(jobs.require(&id).unwrap().status, JobStatus::Running);
        assert!(queue.is_empty().unwrap());
    }
}
