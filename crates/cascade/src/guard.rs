//! Wall-clock budget for one invocation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardDecision {
    Continue,
    /// Starting another operation could overrun the budget.
    Exceeded { elapsed: Duration },
}

/// Measures elapsed time since the invocation started.
///
/// Checked before every unit and every sub-step, never after, so that an
/// operation whose own duration could blow the budget is not started.
#[derive(Clone)]
pub struct TimeoutGuard {
    clock: Arc<dyn Clock>,
    started: DateTime<Utc>,
    budget: Duration,
}

impl TimeoutGuard {
    pub fn start(clock: Arc<dyn Clock>, budget: Duration) -> Self {
        let started = clock.now();
        Self {
            clock,
            started,
            budget,
        }
    }

    pub fn started(&self) -> DateTime<Utc> {
        self.started
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn elapsed(&self) -> Duration {
        (self.clock.now() - self.started)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.elapsed())
    }

    pub fn check(&self) -> GuardDecision {
        let elapsed = self.elapsed();
        if elapsed >= self.budget {
            GuardDecision::Exceeded { elapsed }
        } else {
            GuardDecision::Continue
        }
    }

    pub fn exceeded(&self) -> bool {
        matches!(self.check(), GuardDecision::Exceeded { .. })
    }
}
