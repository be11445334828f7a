//! Wires the library components together from a [`Config`].

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use cascade::config::ContinuationMode;
use cascade::{
    CascadeError, Clock, Config, ConfigError, ContinuationQueue, ContinuationTrigger, Database,
    Generator, HttpTrigger, JobProgressBroadcaster, Orchestrator, OrchestratorSettings,
    QueueTrigger, Sweeper, SystemClock, WorkerPool,
};

use crate::state::AppState;

type Waker = Arc<dyn Fn() + Send + Sync>;

pub struct Services {
    pub state: AppState,
    /// Present in queue mode.
    pub pool: Option<WorkerPool>,
    pub sweep_interval: Option<Duration>,
}

impl Services {
    pub fn build(
        config: &Config,
        db: Database,
        generator: Arc<dyn Generator>,
    ) -> Result<Self, CascadeError> {
        Self::build_with_clock(config, db, generator, Arc::new(SystemClock))
    }

    pub fn build_with_clock(
        config: &Config,
        db: Database,
        generator: Arc<dyn Generator>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CascadeError> {
        let settings = OrchestratorSettings::from_config(config);
        let queue = ContinuationQueue::new(db.clone(), clock.clone());
        let progress = JobProgressBroadcaster::default();

        // The pool needs the orchestrator and the orchestrator's trigger
        // needs the pool's waker, so the waker is bound after the fact.
        let waker_slot: Arc<OnceLock<Waker>> = Arc::new(OnceLock::new());

        let mode = config.orchestrator.continuation;
        let trigger: Arc<dyn ContinuationTrigger> = match mode {
            ContinuationMode::Queue => {
                let slot = Arc::clone(&waker_slot);
                Arc::new(QueueTrigger::new(queue.clone()).with_waker(Arc::new(move || {
                    if let Some(wake) = slot.get() {
                        wake();
                    }
                })))
            }
            ContinuationMode::Http => {
                let base = config.server.public_url.as_deref().ok_or_else(|| {
                    ConfigError::Validation {
                        message: "orchestrator.continuation = http requires server.public_url"
                            .to_string(),
                    }
                })?;
                let trigger = HttpTrigger::for_base_url(base);
                log::info!(
                    "Continuations are posted to {}",
                    cascade::sanitize::redact_url(trigger.endpoint())
                );
                Arc::new(trigger)
            }
        };

        let orchestrator = Arc::new(
            Orchestrator::builder(db, generator)
                .clock(clock)
                .settings(settings.clone())
                .trigger(Arc::clone(&trigger))
                .progress(Arc::new(progress.clone()))
                .build(),
        );

        let pool = match mode {
            ContinuationMode::Queue => {
                let pool = WorkerPool::from_config(
                    Arc::clone(&orchestrator),
                    queue.clone(),
                    config.worker_count,
                    &config.queue,
                )?;
                let _ = waker_slot.set(pool.waker());
                Some(pool)
            }
            ContinuationMode::Http => None,
        };

        let mut sweeper = Sweeper::new(
            orchestrator.jobs().clone(),
            trigger,
            settings.staleness_threshold,
        );
        if mode == ContinuationMode::Queue {
            sweeper = sweeper.with_queue(queue.clone());
        }
        let sweeper = Arc::new(sweeper);

        let state = AppState {
            orchestrator,
            sweeper,
            queue,
            progress,
            waker: pool.as_ref().map(WorkerPool::waker),
        };

        Ok(Self {
            state,
            pool,
            sweep_interval: config
                .sweeper
                .enabled
                .then(|| Duration::from_secs(config.sweeper.interval_secs.max(1))),
        })
    }
}
