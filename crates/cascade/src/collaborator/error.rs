//! Generation collaborator error types.

use thiserror::Error;

use crate::retry::{Classify, ErrorClass};

/// Errors from a generation or translation call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CollaboratorError {
    /// The request did not finish within the timeout.
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Connection refused, reset, DNS failure.
    #[error("Network error: {0}")]
    Network(String),

    /// HTTP 429.
    #[error("Rate limited by collaborator")]
    RateLimited,

    /// HTTP 5xx.
    #[error("Collaborator server error {status}: {body}")]
    Server { status: u16, body: String },

    /// HTTP 402. No call will succeed until credits are topped up.
    #[error("Collaborator credits exhausted")]
    CreditsExhausted,

    /// HTTP 401/403.
    #[error("Collaborator rejected credentials (status {status})")]
    Unauthorized { status: u16 },

    /// Any other 4xx. The request itself is wrong.
    #[error("Collaborator rejected request {status}: {body}")]
    BadRequest { status: u16, body: String },

    /// A well-formed response without content.
    #[error("Collaborator returned no content")]
    EmptyResponse,

    /// Output that could not be parsed, even after repair.
    #[error("Malformed collaborator output: {0}")]
    Malformed(String),
}

impl CollaboratorError {
    /// Maps a non-success HTTP status to an error.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            402 => CollaboratorError::CreditsExhausted,
            401 | 403 => CollaboratorError::Unauthorized { status },
            429 => CollaboratorError::RateLimited,
            500..=599 => CollaboratorError::Server { status, body },
            _ => CollaboratorError::BadRequest { status, body },
        }
    }

    /// Errors that will hit every subsequent call the same way. The
    /// invocation stops instead of burning through the remaining units.
    pub fn halts_job(&self) -> bool {
        matches!(
            self,
            CollaboratorError::CreditsExhausted | CollaboratorError::Unauthorized { .. }
        )
    }
}

impl Classify for CollaboratorError {
    fn class(&self) -> ErrorClass {
        match self {
            CollaboratorError::Timeout(_)
            | CollaboratorError::Network(_)
            | CollaboratorError::RateLimited
            | CollaboratorError::Server { .. }
            | CollaboratorError::EmptyResponse => ErrorClass::Retryable,
            CollaboratorError::CreditsExhausted
            | CollaboratorError::Unauthorized { .. }
            | CollaboratorError::BadRequest { .. }
            | CollaboratorError::Malformed(_) => ErrorClass::Fatal,
        }
    }
}
