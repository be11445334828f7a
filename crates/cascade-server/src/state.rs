use std::sync::Arc;

use cascade::{ContinuationQueue, JobProgressBroadcaster, Orchestrator, Sweeper};

/// Shared state for all handlers. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub sweeper: Arc<Sweeper>,
    pub queue: ContinuationQueue,
    /// Progress events for the SSE stream.
    pub progress: JobProgressBroadcaster,
    /// Wakes the worker pool, when there is one.
    pub waker: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl AppState {
    pub fn wake_workers(&self) {
        if let Some(wake) = &self.waker {
            wake();
        }
    }
}
