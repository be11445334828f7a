//! The orchestration entry point.
//!
//! One call to [`Orchestrator::invoke`] is one bounded invocation: take the
//! job's lease, reconcile against the content store, produce as many units
//! as the caps and time budget allow, persist, and hand off to a fresh
//! invocation if work remains.

pub mod request;
pub mod settings;
mod unit;

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{info_span, Instrument};

use crate::clock::{Clock, SystemClock};
use crate::collaborator::Generator;
use crate::db::Database;
use crate::error::{CascadeError, JobError};
use crate::guard::TimeoutGuard;
use crate::job::{
    DimensionStatus, FailureKind, JobRecord, JobRecordStore, JobStatus, Lease, NewJob,
    ResumePointer,
};
use crate::linker::{self, LinkOutcome, LinkingPass};
use crate::planner::{PlanError, Reconciliation, ResumePlanner};
use crate::preflight::Preflight;
use crate::progress::{JobProgressEvent, NoopProgress, ProgressReporter};
use crate::retry::RetryExecutor;
use crate::store::{ContentRecord, ContentStore, SqliteContentStore};
use crate::trigger::{ContinuationTrigger, NoopTrigger};
use crate::unit::{Dimension, UnitKey};
use crate::writer::UnitWriter;

pub use request::{InvokeRequest, InvokeResponse, ResponseStatus};
pub use settings::OrchestratorSettings;

use unit::UnitOutcome;

/// Why the unit loop stopped before running out of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    /// Per-invocation unit or dimension cap.
    Cap,
    /// Time budget.
    Budget,
    /// A collaborator error that no retry can fix.
    Halt,
}

#[derive(Debug, Default)]
struct RunState {
    processed: u64,
    stop: Option<StopReason>,
    pointer: Option<ResumePointer>,
    halted: Option<String>,
    missing_prerequisites: Vec<String>,
    blocked_keys: HashSet<UnitKey>,
}

pub struct OrchestratorBuilder {
    db: Database,
    generator: Arc<dyn Generator>,
    store: Option<Arc<dyn ContentStore>>,
    trigger: Arc<dyn ContinuationTrigger>,
    progress: Arc<dyn ProgressReporter>,
    clock: Arc<dyn Clock>,
    settings: OrchestratorSettings,
}

impl OrchestratorBuilder {
    pub fn new(db: Database, generator: Arc<dyn Generator>) -> Self {
        Self {
            db,
            generator,
            store: None,
            trigger: Arc::new(NoopTrigger),
            progress: Arc::new(NoopProgress),
            clock: Arc::new(SystemClock),
            settings: OrchestratorSettings::default(),
        }
    }

    /// Uses `store` instead of the SQLite store on the same database.
    pub fn store(mut self, store: Arc<dyn ContentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn trigger(mut self, trigger: Arc<dyn ContinuationTrigger>) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> Orchestrator {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(SqliteContentStore::new(self.db.clone(), self.clock.clone())));
        let retry = RetryExecutor::new(self.settings.retry.clone());
        let writer = UnitWriter::new(
            store.clone(),
            self.generator.clone(),
            retry.clone(),
            self.clock.clone(),
            self.settings.rephrase_attempts,
        );

        Orchestrator {
            jobs: JobRecordStore::new(self.db, self.clock.clone()),
            planner: ResumePlanner::new(store.clone()),
            linker: LinkingPass::new(store.clone()),
            store,
            generator: self.generator,
            trigger: self.trigger,
            progress: self.progress,
            clock: self.clock,
            settings: self.settings,
            retry,
            writer,
        }
    }
}

pub struct Orchestrator {
    jobs: JobRecordStore,
    store: Arc<dyn ContentStore>,
    generator: Arc<dyn Generator>,
    trigger: Arc<dyn ContinuationTrigger>,
    progress: Arc<dyn ProgressReporter>,
    clock: Arc<dyn Clock>,
    settings: OrchestratorSettings,
    retry: RetryExecutor,
    planner: ResumePlanner,
    writer: UnitWriter,
    linker: LinkingPass,
}

impl Orchestrator {
    pub fn builder(db: Database, generator: Arc<dyn Generator>) -> OrchestratorBuilder {
        OrchestratorBuilder::new(db, generator)
    }

    pub fn jobs(&self) -> &JobRecordStore {
        &self.jobs
    }

    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.store
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn create_job(&self, request: &NewJob) -> Result<JobRecord, JobError> {
        let job = self.jobs.create(request)?;
        self.progress.report(JobProgressEvent::from_job(&job));
        Ok(job)
    }

    /// Creates a job and fires its first invocation through the trigger.
    pub async fn submit_job(&self, request: &NewJob) -> Result<JobRecord, JobError> {
        let job = self.create_job(request)?;
        log::info!(
            "Job {} created: {} over {} dimension(s)",
            job.id,
            job.spec.pipeline,
            job.work_queue.len()
        );
        if let Err(e) = self.trigger.fire(&job.id, None).await {
            log::error!("Job {}: first invocation could not be triggered: {}", job.id, e);
        }
        Ok(job)
    }

    pub fn get_job(&self, id: &str) -> Result<Option<JobRecord>, JobError> {
        self.jobs.get(id)
    }

    pub fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<(Vec<JobRecord>, u64), JobError> {
        self.jobs.list(status, limit, offset)
    }

    /// Fails a non-terminal job. An invocation already in flight sees the
    /// terminal status on its next save and stops.
    pub fn abort(&self, id: &str, reason: &str) -> Result<JobRecord, JobError> {
        let job = self.jobs.abort(id, reason)?;
        self.progress.report(JobProgressEvent::from_job(&job));
        Ok(job)
    }

    /// Re-derives the job's dimension view from the content store and
    /// caches it on the record. Does not take the lease.
    pub fn reconcile(&self, id: &str) -> Result<Reconciliation, CascadeError> {
        let mut job = self.jobs.require(id)?;
        let plan = self.planner.reconcile(&job)?;
        plan.apply(&mut job);
        self.jobs.update_dimensions(&job)?;
        Ok(plan)
    }

    /// Runs one invocation. Never fails: every outcome, including internal
    /// errors, is reported in the response.
    pub async fn invoke(&self, request: InvokeRequest) -> InvokeResponse {
        let span = info_span!("invocation", job_id = %request.job_id);
        async {
            match self.run(&request).await {
                Ok(response) => response,
                Err(CascadeError::Job(JobError::NotFound(id))) => {
                    InvokeResponse::new(ResponseStatus::Failed, format!("Job '{}' not found", id))
                }
                Err(CascadeError::Job(JobError::LeaseLost { id })) => {
                    log::warn!("Job {}: lease lost mid-invocation, stopping", id);
                    self.current_state(&id, "Lease lost to another invocation; stopped")
                }
                Err(e) => {
                    log::error!("Job {}: invocation failed: {}", request.job_id, e);
                    let mut response = self.current_state(&request.job_id, e.to_string());
                    response.success = false;
                    response
                }
            }
        }
        .instrument(span)
        .await
    }

    fn current_state(&self, id: &str, message: impl Into<String>) -> InvokeResponse {
        let message = message.into();
        match self.jobs.get(id) {
            Ok(Some(job)) => InvokeResponse::snapshot(&job, message),
            _ => InvokeResponse::new(ResponseStatus::Failed, message),
        }
    }

    async fn run(&self, request: &InvokeRequest) -> Result<InvokeResponse, CascadeError> {
        let mut job = self.jobs.require(&request.job_id)?;

        if job.status.is_terminal() {
            return Ok(InvokeResponse::snapshot(
                &job,
                format!("Job is already {}", job.status),
            ));
        }

        let only = request.dimension.as_deref().map(Dimension::new);
        if let Some(dimension) = &only {
            if !job.work_queue.contains(dimension) {
                return Err(JobError::InvalidRequest(format!(
                    "dimension '{}' is not in the job's work queue",
                    dimension
                ))
                .into());
            }
        }
        let pointer = match request.resume_pointer.as_deref() {
            Some(raw) => Some(raw.parse::<ResumePointer>()?),
            None => None,
        };

        if request.dry_run {
            return self.dry_run(&job, only.as_ref());
        }

        let threshold = self.settings.staleness_threshold;
        if job.status == JobStatus::Running {
            if !job.is_stale(self.clock.now(), threshold) {
                return Ok(InvokeResponse::snapshot(
                    &job,
                    "Job is already running; returning current progress",
                ));
            }
            let reason = "Lock expired; previous invocation presumed dead";
            if !self.jobs.reset_stale(&job.id, threshold, reason)? {
                let current = self.jobs.require(&job.id)?;
                return Ok(InvokeResponse::snapshot(
                    &current,
                    "Job is already running; returning current progress",
                ));
            }
            job = self.jobs.require(&job.id)?;
        }

        if request.retry_failed {
            let cleared = self.jobs.clear_failures(&job.id, Some(FailureKind::Failed))?;
            log::info!("Job {}: cleared {} failed unit(s) for retry", job.id, cleared);
        }

        let Some(mut lease) = self.jobs.try_acquire(&mut job, self.settings.lease_ttl())? else {
            let current = self.jobs.require(&job.id)?;
            return Ok(InvokeResponse::snapshot(
                &current,
                "Another invocation took the job; returning current progress",
            ));
        };

        let guard = TimeoutGuard::start(self.clock.clone(), self.settings.time_budget);
        match self
            .drive(&mut job, &mut lease, &guard, only.as_ref(), pointer)
            .await
        {
            Err(e @ CascadeError::Job(JobError::LeaseLost { .. })) => Err(e),
            Err(e) => {
                // Don't leave the row locked until the lease expires.
                job.error = Some(e.to_string());
                if job.transition(JobStatus::Stalled).is_ok() {
                    if let Err(release_err) = self.jobs.release(&mut job, lease) {
                        log::error!("Job {}: failed to release lease: {}", job.id, release_err);
                    }
                }
                Err(e)
            }
            ok => ok,
        }
    }

    async fn drive(
        &self,
        job: &mut JobRecord,
        lease: &mut Lease,
        guard: &TimeoutGuard,
        only: Option<&Dimension>,
        pointer: Option<ResumePointer>,
    ) -> Result<InvokeResponse, CascadeError> {
        let plan = match self.planner.reconcile(job) {
            Ok(plan) => plan,
            Err(e @ PlanError::NoSourceContent { .. }) => {
                return self.fail(job, lease, e.to_string());
            }
            Err(e) => return Err(e.into()),
        };
        plan.apply(job);

        if let Some(p) = &pointer {
            let still_missing = plan
                .report(&p.dimension)
                .is_some_and(|r| r.missing.iter().any(|k| k.parent_content_id == p.parent_content_id));
            if still_missing {
                log::info!("Job {}: resuming at {}", job.id, p);
            } else {
                log::info!("Job {}: ignoring resume pointer {}, unit already exists", job.id, p);
            }
        }
        job.resume_pointer = None;

        let mut run = RunState::default();
        if !plan.is_complete() {
            self.produce(job, lease, guard, &plan, only, &mut run).await?;
        }
        self.finish(job, lease, guard, run).await
    }

    async fn produce(
        &self,
        job: &mut JobRecord,
        lease: &mut Lease,
        guard: &TimeoutGuard,
        plan: &Reconciliation,
        only: Option<&Dimension>,
        run: &mut RunState,
    ) -> Result<(), CascadeError> {
        let max_units = self.settings.max_units as u64;
        let exhausted = self
            .jobs
            .exhausted_units(&job.id, self.settings.max_unit_failures)?;
        let previously_blocked: HashSet<UnitKey> = self
            .jobs
            .failures(&job.id)?
            .into_iter()
            .filter(|f| f.kind == FailureKind::Blocked)
            .map(|f| f.key)
            .collect();

        let mut skip: HashSet<Dimension> = match only {
            Some(d) => job.work_queue.iter().filter(|w| *w != d).cloned().collect(),
            None => HashSet::new(),
        };
        let mut dimensions_started = 0;

        'dimensions: while let Some(report) = plan.next_incomplete(&skip) {
            let dimension = report.dimension.clone();
            skip.insert(dimension.clone());

            let candidates: Vec<ContentRecord> = report
                .missing
                .iter()
                .filter(|k| !exhausted.contains(*k))
                .filter_map(|k| plan.source(&k.parent_content_id).cloned())
                .collect();
            if candidates.is_empty() {
                log::info!(
                    "Job {}: every missing unit in {} has used up its attempts",
                    job.id,
                    dimension
                );
                continue;
            }
            if dimensions_started >= self.settings.max_dimensions || run.processed >= max_units {
                run.stop = Some(StopReason::Cap);
                break;
            }

            let preflight = Preflight::check(self.store.as_ref(), &job.spec, &dimension, candidates)?;
            for blocked in &preflight.blocked {
                let key = blocked.source.key_for(&dimension);
                self.jobs.record_failure(
                    &job.id,
                    &key,
                    FailureKind::Blocked,
                    &format!("missing prerequisite {}", blocked.missing),
                )?;
                run.blocked_keys.insert(key);
            }
            for ready in &preflight.ready {
                let key = ready.source.key_for(&dimension);
                if previously_blocked.contains(&key) {
                    self.jobs.clear_failure(&job.id, &key)?;
                }
            }
            for missing in preflight.missing_prerequisites() {
                if !run.missing_prerequisites.contains(&missing) {
                    run.missing_prerequisites.push(missing);
                }
            }
            if preflight.all_blocked() {
                log::warn!(
                    "Job {}: {} is blocked on {} missing prerequisite(s)",
                    job.id,
                    dimension,
                    preflight.missing_prerequisites().len()
                );
                continue;
            }

            dimensions_started += 1;
            let expected = report.expected as u64;
            let mut done = report.actual as u64;
            job.dimension_status
                .insert(dimension.clone(), DimensionStatus::Running);
            self.save_progress(
                job,
                lease,
                format!("Processing {} ({}/{})", dimension, done, expected),
                &dimension,
                done,
                expected,
            )?;

            for (index, ready) in preflight.ready.iter().enumerate() {
                if index > 0 && !self.settings.unit_delay.is_zero() {
                    tokio::time::sleep(self.settings.unit_delay).await;
                }
                let key = ready.source.key_for(&dimension);
                if run.processed >= max_units {
                    run.stop = Some(StopReason::Cap);
                    run.pointer = Some(ResumePointer::new(dimension.clone(), 0, &key.parent_content_id));
                    break 'dimensions;
                }
                if guard.exceeded() {
                    run.stop = Some(StopReason::Budget);
                    run.pointer = Some(ResumePointer::new(dimension.clone(), 0, &key.parent_content_id));
                    break 'dimensions;
                }

                let span = info_span!("unit", dimension = %dimension, parent = %key.parent_content_id);
                let outcome = self
                    .produce_unit(job, ready, &dimension, guard)
                    .instrument(span)
                    .await?;

                match outcome {
                    UnitOutcome::Written(written) => {
                        run.processed += 1;
                        done += 1;
                        job.progress.processed_total += 1;
                        self.jobs.clear_failure(&job.id, &key)?;
                        let record = written.record();
                        linker::sync_group(self.store.as_ref(), record.group_key())?;
                        log::info!(
                            "Job {}: wrote {} as '{}' ({}/{})",
                            job.id,
                            key,
                            record.slug,
                            done,
                            expected
                        );
                        self.save_progress(
                            job,
                            lease,
                            format!("Processed {}/{} units in {}", done, expected, dimension),
                            &dimension,
                            done,
                            expected,
                        )?;
                    }
                    UnitOutcome::Interrupted { step } => {
                        run.stop = Some(StopReason::Budget);
                        run.pointer = Some(ResumePointer::new(dimension.clone(), step, &key.parent_content_id));
                        break 'dimensions;
                    }
                    UnitOutcome::Failed { error, halt } => {
                        let attempts =
                            self.jobs
                                .record_failure(&job.id, &key, FailureKind::Failed, &error)?;
                        log::warn!(
                            "Job {}: unit {} failed (attempt {}): {}",
                            job.id,
                            key,
                            attempts,
                            error
                        );
                        if halt {
                            run.stop = Some(StopReason::Halt);
                            run.halted = Some(error);
                            break 'dimensions;
                        }
                        self.save_progress(
                            job,
                            lease,
                            format!("Unit {} failed; continuing", key),
                            &dimension,
                            done,
                            expected,
                        )?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn finish(
        &self,
        job: &mut JobRecord,
        lease: &mut Lease,
        guard: &TimeoutGuard,
        run: RunState,
    ) -> Result<InvokeResponse, CascadeError> {
        let plan = match self.planner.reconcile(job) {
            Ok(plan) => plan,
            Err(e @ PlanError::NoSourceContent { .. }) => {
                return self.fail(job, lease, e.to_string());
            }
            Err(e) => return Err(e.into()),
        };
        plan.apply(job);

        let expected: usize = plan.dimensions.iter().map(|d| d.expected).sum();
        let actual: usize = plan.dimensions.iter().map(|d| d.actual).sum();
        job.progress.expected_count = expected as u64;
        job.progress.current_count = actual as u64;
        job.progress.current_dimension = None;
        job.progress.timestamp = self.clock.now();
        job.progress.failures = self.jobs.failures(&job.id)?;

        if plan.is_complete() {
            if job.linked_at.is_none() {
                if let LinkOutcome::Interrupted { .. } = self.linker.run(job, guard)? {
                    job.transition(JobStatus::Stalled)?;
                    job.progress.message = "All units written; linking continues".to_string();
                    return self
                        .close(job, lease, &run, None, true, ResponseStatus::Stalled, 0)
                        .await;
                }
            }
            job.transition(JobStatus::Completed)?;
            job.error = None;
            job.progress.message = format!(
                "Completed: {} unit(s) across {} dimension(s)",
                actual,
                plan.dimensions.len()
            );
            return self
                .close(job, lease, &run, None, false, ResponseStatus::Completed, 0)
                .await;
        }

        let remaining = plan.remaining() as u64;
        let exhausted = self
            .jobs
            .exhausted_units(&job.id, self.settings.max_unit_failures)?;
        let retryable = plan
            .dimensions
            .iter()
            .flat_map(|d| d.missing.iter())
            .filter(|k| !exhausted.contains(*k) && !run.blocked_keys.contains(*k))
            .count();

        let (status, handoff, pointer, response_status) = match run.stop {
            Some(StopReason::Budget) => {
                job.error = None;
                job.progress.message = format!(
                    "Time budget reached after {} unit(s); continuing",
                    run.processed
                );
                (JobStatus::Stalled, true, run.pointer.clone(), ResponseStatus::Stalled)
            }
            Some(StopReason::Cap) => {
                job.error = None;
                job.progress.message = format!(
                    "Invocation cap reached after {} unit(s); continuing",
                    run.processed
                );
                (JobStatus::Partial, true, run.pointer.clone(), ResponseStatus::Partial)
            }
            Some(StopReason::Halt) => {
                let error = run.halted.clone().unwrap_or_default();
                job.progress.message = format!("Stopped: {}", error);
                job.error = Some(error);
                (JobStatus::Partial, false, None, ResponseStatus::Partial)
            }
            None if run.processed == 0 && retryable == 0 && !run.missing_prerequisites.is_empty() => {
                let reason = format!(
                    "Blocked on {} missing prerequisite(s)",
                    run.missing_prerequisites.len()
                );
                job.progress.message = reason.clone();
                job.error = Some(reason);
                (JobStatus::Partial, false, None, ResponseStatus::Blocked)
            }
            None => {
                job.error = None;
                job.progress.message = if retryable > 0 {
                    format!("{} unit(s) left to retry; continuing", retryable)
                } else {
                    format!("{} unit(s) could not be produced", remaining)
                };
                (JobStatus::Partial, retryable > 0, None, ResponseStatus::Partial)
            }
        };
        job.transition(status)?;
        self.close(job, lease, &run, pointer, handoff, response_status, remaining)
            .await
    }

    /// Persists the final state, gives up the lease, reports, and hands off.
    #[allow(clippy::too_many_arguments)]
    async fn close(
        &self,
        job: &mut JobRecord,
        lease: &mut Lease,
        run: &RunState,
        pointer: Option<ResumePointer>,
        handoff: bool,
        status: ResponseStatus,
        remaining: u64,
    ) -> Result<InvokeResponse, CascadeError> {
        job.resume_pointer = pointer;
        self.jobs.release(job, lease.clone())?;
        self.progress.report(JobProgressEvent::from_job(job));
        log::info!(
            "Job {}: invocation finished as {} ({} processed, {} remaining)",
            job.id,
            job.status,
            run.processed,
            remaining
        );

        let mut response = match status {
            ResponseStatus::Blocked => InvokeResponse::blocked(
                job.progress.message.clone(),
                run.missing_prerequisites.clone(),
            ),
            other => InvokeResponse::new(other, job.progress.message.clone()),
        };
        response.processed_count = run.processed;
        response.remaining_count = remaining;
        response.resume_pointer = job.resume_pointer.as_ref().map(|p| p.to_string());
        response.failures = job.progress.failures.clone();

        if handoff && self.settings.auto_continue {
            self.hand_off(&job.id, job.resume_pointer.as_ref()).await;
        }
        Ok(response)
    }

    fn fail(
        &self,
        job: &mut JobRecord,
        lease: &mut Lease,
        reason: String,
    ) -> Result<InvokeResponse, CascadeError> {
        log::error!("Job {}: failed: {}", job.id, reason);
        job.transition(JobStatus::Failed)?;
        job.error = Some(reason.clone());
        job.resume_pointer = None;
        job.progress.message = reason.clone();
        job.progress.timestamp = self.clock.now();
        self.jobs.release(job, lease.clone())?;
        self.progress.report(JobProgressEvent::from_job(job));
        Ok(InvokeResponse::new(ResponseStatus::Failed, reason))
    }

    fn save_progress(
        &self,
        job: &mut JobRecord,
        lease: &mut Lease,
        message: String,
        dimension: &Dimension,
        current: u64,
        expected: u64,
    ) -> Result<(), CascadeError> {
        job.progress.message = message;
        job.progress.current_dimension = Some(dimension.clone());
        job.progress.current_count = current;
        job.progress.expected_count = expected;
        job.progress.timestamp = self.clock.now();
        self.jobs.save(job, lease, self.settings.lease_ttl())?;
        self.progress.report(JobProgressEvent::from_job(job));
        Ok(())
    }

    /// Fires the continuation unless the job no longer needs one. Trigger
    /// failures are logged; the sweeper recovers dropped handoffs.
    async fn hand_off(&self, job_id: &str, pointer: Option<&ResumePointer>) {
        match self.jobs.get(job_id) {
            Ok(Some(job)) if job.status.is_terminal() => {
                log::debug!("Job {}: {} meanwhile, no continuation", job_id, job.status);
                return;
            }
            Ok(Some(job))
                if job.status == JobStatus::Running
                    && !job.is_stale(self.clock.now(), self.settings.staleness_threshold) =>
            {
                log::info!("Job {}: another invocation is active, no continuation", job_id);
                return;
            }
            Ok(None) => return,
            Err(e) => {
                log::error!("Job {}: could not re-read before handoff: {}", job_id, e);
                return;
            }
            Ok(Some(_)) => {}
        }

        match self.trigger.fire(job_id, pointer).await {
            Ok(()) => log::debug!("Job {}: continuation handed off", job_id),
            Err(e) => log::error!("Job {}: continuation handoff failed: {}", job_id, e),
        }
    }

    fn dry_run(
        &self,
        job: &JobRecord,
        only: Option<&Dimension>,
    ) -> Result<InvokeResponse, CascadeError> {
        let plan = match self.planner.reconcile(job) {
            Ok(plan) => plan,
            Err(e @ PlanError::NoSourceContent { .. }) => {
                return Ok(InvokeResponse::new(
                    ResponseStatus::Failed,
                    format!("Dry run: {}", e),
                ));
            }
            Err(e) => return Err(e.into()),
        };

        let skip: HashSet<Dimension> = match only {
            Some(d) => job.work_queue.iter().filter(|w| *w != d).cloned().collect(),
            None => HashSet::new(),
        };
        let remaining = plan.remaining() as u64;

        let Some(report) = plan.next_incomplete(&skip) else {
            let message = if job.linked_at.is_none() {
                "Dry run: all units exist; linking pass pending"
            } else {
                "Dry run: nothing to do"
            };
            let mut response = InvokeResponse::new(job.status.into(), message);
            response.remaining_count = remaining;
            return Ok(response);
        };

        let exhausted = self
            .jobs
            .exhausted_units(&job.id, self.settings.max_unit_failures)?;
        let candidates: Vec<ContentRecord> = report
            .missing
            .iter()
            .filter(|k| !exhausted.contains(*k))
            .filter_map(|k| plan.source(&k.parent_content_id).cloned())
            .collect();
        let preflight = Preflight::check(self.store.as_ref(), &job.spec, &report.dimension, candidates)?;

        let mut response = if preflight.all_blocked() {
            InvokeResponse::blocked(
                format!("Dry run: {} is blocked", report.dimension),
                preflight.missing_prerequisites(),
            )
        } else {
            InvokeResponse::new(
                job.status.into(),
                format!(
                    "Dry run: next dimension {} has {} of {} units missing, {} ready",
                    report.dimension,
                    report.missing.len(),
                    report.expected,
                    preflight.ready.len()
                ),
            )
        };
        response.remaining_count = remaining;
        response.failures = self.jobs.failures(&job.id)?;
        Ok(response)
    }
}
