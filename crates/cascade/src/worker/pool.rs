use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};

use crate::config::schema::QueueConfig;
use crate::error::WorkerError;
use crate::orchestrator::{InvokeRequest, InvokeResponse, Orchestrator};
use crate::queue::{Continuation, ContinuationQueue};

/// Result of one continuation run by a worker.
#[derive(Debug, Clone)]
pub struct WorkerOutcome {
    pub worker_id: usize,
    pub job_id: String,
    pub response: InvokeResponse,
}

/// Runs queued continuations on dedicated threads.
///
/// Each worker owns a single-threaded tokio runtime and drives one
/// invocation at a time. Idle workers block on the wake channel and fall
/// back to polling the queue, so a lost wake-up only costs one poll
/// interval.
pub struct WorkerPool {
    queue: ContinuationQueue,
    wake_sender: Sender<()>,
    result_receiver: Receiver<WorkerOutcome>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn from_config(
        orchestrator: Arc<Orchestrator>,
        queue: ContinuationQueue,
        worker_count: usize,
        config: &QueueConfig,
    ) -> Result<Self, WorkerError> {
        Self::new(
            orchestrator,
            queue,
            worker_count,
            Duration::from_secs(config.claim_ttl_secs),
            Duration::from_millis(config.poll_interval_ms),
        )
    }

    pub fn new(
        orchestrator: Arc<Orchestrator>,
        queue: ContinuationQueue,
        worker_count: usize,
        claim_ttl: Duration,
        poll_interval: Duration,
    ) -> Result<Self, WorkerError> {
        if worker_count == 0 {
            return Err(WorkerError::SpawnFailed(
                "worker_count must be > 0".to_string(),
            ));
        }
        let (wake_sender, wake_receiver) = bounded::<()>(worker_count * 2);
        let (result_sender, result_receiver) = bounded::<WorkerOutcome>(worker_count * 4);
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let worker = Worker {
                id: worker_id,
                name: format!("worker-{}", worker_id),
                orchestrator: Arc::clone(&orchestrator),
                queue: queue.clone(),
                wake: wake_receiver.clone(),
                results: result_sender.clone(),
                shutdown: Arc::clone(&shutdown),
                claim_ttl,
                poll_interval,
            };
            let handle = thread::Builder::new()
                .name(worker.name.clone())
                .spawn(move || worker.run())
                .map_err(|e| WorkerError::SpawnFailed(e.to_string()))?;
            workers.push(handle);
        }

        info!("Started {} workers", worker_count);

        Ok(Self {
            queue,
            wake_sender,
            result_receiver,
            workers,
            shutdown,
        })
    }

    /// Queues a continuation for `job_id` and wakes a worker.
    pub fn submit(&self, job_id: &str) -> Result<(), WorkerError> {
        if self.is_shutdown() {
            return Err(WorkerError::ChannelClosed);
        }
        self.queue.enqueue(job_id, None)?;
        self.wake();
        Ok(())
    }

    /// Nudges one idle worker to check the queue.
    pub fn wake(&self) {
        // A full channel already has enough pending wake-ups.
        let _ = self.wake_sender.try_send(());
    }

    /// A wake function for [`QueueTrigger::with_waker`](crate::trigger::QueueTrigger::with_waker).
    pub fn waker(&self) -> Arc<dyn Fn() + Send + Sync> {
        let sender = self.wake_sender.clone();
        Arc::new(move || {
            let _ = sender.try_send(());
        })
    }

    pub fn try_recv_result(&self) -> Option<WorkerOutcome> {
        self.result_receiver.try_recv().ok()
    }

    pub fn recv_result(&self) -> Option<WorkerOutcome> {
        self.result_receiver.recv().ok()
    }

    pub fn recv_result_timeout(&self, timeout: Duration) -> Option<WorkerOutcome> {
        self.result_receiver.recv_timeout(timeout).ok()
    }

    pub fn shutdown(&self) {
        info!("Shutting down worker pool...");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn wait(self) {
        // Workers blocked on the wake channel see it disconnect.
        drop(self.wake_sender);

        for (i, worker) in self.workers.into_iter().enumerate() {
            if let Err(e) = worker.join() {
                error!("Worker {} panicked: {:?}", i, e);
            } else {
                debug!("Worker {} finished", i);
            }
        }

        info!("All workers have stopped");
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

struct Worker {
    id: usize,
    name: String,
    orchestrator: Arc<Orchestrator>,
    queue: ContinuationQueue,
    wake: Receiver<()>,
    results: Sender<WorkerOutcome>,
    shutdown: Arc<AtomicBool>,
    claim_ttl: Duration,
    poll_interval: Duration,
}

impl Worker {
    fn run(self) {
        debug!("Worker {} started", self.id);

        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                error!("Worker {} could not start a runtime: {}", self.id, e);
                return;
            }
        };

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                debug!("Worker {} received shutdown signal", self.id);
                break;
            }

            match self.queue.claim(&self.name, self.claim_ttl) {
                Ok(Some(continuation)) => {
                    if !self.execute(&runtime, continuation) {
                        break;
                    }
                    continue;
                }
                Ok(None) => {}
                Err(e) => error!("Worker {} failed to claim from queue: {}", self.id, e),
            }

            match self.wake.recv_timeout(self.poll_interval) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("Worker {} wake channel disconnected", self.id);
                    break;
                }
            }
        }

        debug!("Worker {} stopped", self.id);
    }

    /// Runs one claimed continuation. Returns false when the pool is gone.
    fn execute(&self, runtime: &tokio::runtime::Runtime, continuation: Continuation) -> bool {
        debug!(
            "Worker {} running continuation {} for job {}",
            self.id, continuation.id, continuation.job_id
        );
        let mut request = InvokeRequest::new(&continuation.job_id);
        request.resume_pointer = continuation.resume_pointer.as_ref().map(|p| p.to_string());

        let orchestrator = &self.orchestrator;
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            runtime.block_on(orchestrator.invoke(request))
        }));

        let response = match result {
            Ok(response) => {
                if let Err(e) = self.queue.complete(continuation.id) {
                    error!("Worker {}: failed to complete continuation {}: {}", self.id, continuation.id, e);
                }
                response
            }
            Err(_) => {
                warn!(
                    "Worker {}: invocation for job {} panicked, releasing continuation",
                    self.id, continuation.job_id
                );
                if let Err(e) = self.queue.release(continuation.id) {
                    error!("Worker {}: failed to release continuation {}: {}", self.id, continuation.id, e);
                }
                return true;
            }
        };

        let outcome = WorkerOutcome {
            worker_id: self.id,
            job_id: continuation.job_id,
            response,
        };
        if let Err(e) = self.results.try_send(outcome) {
            // Nobody is draining results; the job record has the outcome.
            if e.is_disconnected() {
                return false;
            }
            debug!("Worker {}: result channel full, dropping outcome", self.id);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::collaborator::{CollaboratorError, Generator, RephraseRequest, StepRequest};
    use crate::db::Database;
    use crate::orchestrator::ResponseStatus;
    use async_trait::async_trait;

    struct Silent;

    #[async_trait]
    impl Generator for Silent {
        async fn produce(&self, _r: &StepRequest) -> Result<String, CollaboratorError> {
            Err(CollaboratorError::EmptyResponse)
        }

        async fn rephrase(&self, _r: &RephraseRequest) -> Result<String, CollaboratorError> {
            Err(CollaboratorError::EmptyResponse)
        }
    }

    fn pool(workers: usize) -> (WorkerPool, ContinuationQueue) {
        let db = Database::open_in_memory().unwrap();
        let queue = ContinuationQueue::new(db.clone(), Arc::new(SystemClock));
        let orchestrator = Arc::new(Orchestrator::builder(db, Arc::new(Silent)).build());
        let pool = WorkerPool::new(
            orchestrator,
            queue.clone(),
            workers,
            Duration::from_secs(60),
            Duration::from_millis(20),
        )
        .unwrap();
        (pool, queue)
    }

    #[test]
    fn test_worker_pool_creation() {
        let (pool, _) = pool(2);
        assert!(!pool.is_shutdown());

        pool.shutdown();
        assert!(pool.is_shutdown());
        assert!(pool.submit("job-1").is_err());

        pool.wait();
    }

    #[test]
    fn test_zero_workers_rejected() {
        let db = Database::open_in_memory().unwrap();
        let queue = ContinuationQueue::new(db.clone(), Arc::new(SystemClock));
        let orchestrator = Arc::new(Orchestrator::builder(db, Arc::new(Silent)).build());
        let result = WorkerPool::new(orchestrator, queue, 0, Duration::from_secs(1), Duration::from_secs(1));
        assert!(matches!(result, Err(WorkerError::SpawnFailed(_))));
    }

    #[test]
    fn test_submitted_continuation_is_run_and_removed() {
        let (pool, queue) = pool(1);
        pool.submit("no-such-job").unwrap();

        let outcome = pool.recv_result_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(outcome.job_id, "no-such-job");
        assert_eq!(outcome.response.status, ResponseStatus::Failed);
        assert!(queue.is_empty().unwrap());

        pool.shutdown();
        pool.wait();
    }
}
