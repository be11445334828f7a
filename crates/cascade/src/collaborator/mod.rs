//! The generation/translation collaborator.
//!
//! Content quality is not this crate's concern; the orchestrator only needs
//! something that turns a source unit into structured output, one sub-step
//! at a time, and can rephrase a title on request.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::unit::{Dimension, UnitKey};

pub mod error;
pub mod http;

pub use error::CollaboratorError;
pub use http::HttpGenerator;

/// Name of the single step used when a pipeline declares none.
pub const DEFAULT_STEP: &str = "content";

/// One sub-step call for one unit.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRequest {
    pub pipeline: String,
    pub step: String,
    pub step_index: usize,
    pub key: UnitKey,
    pub source_dimension: Dimension,
    pub source_title: String,
    pub source_body: Value,
    /// Outputs of the steps already completed for this unit.
    pub previous: BTreeMap<String, Value>,
}

/// A request for a differently worded title.
#[derive(Debug, Clone, PartialEq)]
pub struct RephraseRequest {
    pub key: UnitKey,
    pub title: String,
    /// Titles already used in the dimension that the new one must avoid.
    pub taken: Vec<String>,
    pub attempt: u32,
}

#[async_trait]
pub trait Generator: Send + Sync {
    /// Ordered sub-step names for a pipeline.
    fn steps(&self, pipeline: &str) -> Vec<String> {
        let _ = pipeline;
        vec![DEFAULT_STEP.to_string()]
    }

    /// Runs one sub-step and returns the raw output, expected to be a JSON
    /// object.
    async fn produce(&self, request: &StepRequest) -> Result<String, CollaboratorError>;

    /// Returns a new title as plain text.
    async fn rephrase(&self, request: &RephraseRequest) -> Result<String, CollaboratorError>;
}
