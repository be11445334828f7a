//! Bounded retries with exponential backoff.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use log::{debug, warn};

use crate::config::schema::RetryConfig;

/// Whether a failure is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Timeouts, 5xx, rate limits, dropped connections.
    Retryable,
    /// Bad input, exhausted quota, authorization.
    Fatal,
}

/// Errors that know their own [`ErrorClass`].
pub trait Classify {
    fn class(&self) -> ErrorClass;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Delay before attempt `attempt + 1`, given that `attempt` (1-based)
    /// just failed. Doubles each time, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }
}

#[derive(Debug)]
pub enum RetryError<E> {
    /// A fatal error; no further attempts were made.
    Fatal { error: E, attempts: u32 },
    /// Every attempt failed with a retryable error.
    Exhausted { last: E, attempts: u32 },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Fatal { attempts, .. } | RetryError::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn into_inner(self) -> E {
        match self {
            RetryError::Fatal { error, .. } => error,
            RetryError::Exhausted { last, .. } => last,
        }
    }

    pub fn inner(&self) -> &E {
        match self {
            RetryError::Fatal { error, .. } => error,
            RetryError::Exhausted { last, .. } => last,
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Fatal { error, attempts } => {
                write!(f, "{} (fatal, after {} attempt(s))", error, attempts)
            }
            RetryError::Exhausted { last, attempts } => {
                write!(f, "{} (gave up after {} attempts)", last, attempts)
            }
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}

/// Runs an operation under a [`RetryPolicy`].
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Calls `op` with the 1-based attempt number until it succeeds, fails
    /// fatally, or runs out of attempts.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        let max = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("{} succeeded on attempt {}", label, attempt);
                    }
                    return Ok(value);
                }
                Err(error) if error.class() == ErrorClass::Fatal => {
                    warn!("{} failed fatally on attempt {}: {}", label, attempt, error);
                    return Err(RetryError::Fatal {
                        error,
                        attempts: attempt,
                    });
                }
                Err(error) if attempt >= max => {
                    warn!("{} failed after {} attempts: {}", label, attempt, error);
                    return Err(RetryError::Exhausted {
                        last: error,
                        attempts: attempt,
                    });
                }
                Err(error) => {
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        "{} attempt {}/{} failed: {}; retrying in {:?}",
                        label, attempt, max, error, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
