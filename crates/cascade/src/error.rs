use std::path::PathBuf;
use thiserror::Error;

use crate::job::JobStatus;

#[derive(Error, Debug)]
pub enum CascadeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Content store error: {0}")]
    Store(#[from] crate::store::StoreError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Planning error: {0}")]
    Plan(#[from] crate::planner::PlanError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Failed to parse config YAML: {0}")]
    ParseYaml(#[from] serde_yaml::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Invalid environment override '{name}': {reason}")]
    InvalidOverride { name: String, reason: String },

    #[error("Secret resolution failed: {0}")]
    Secret(#[from] crate::secrets::SecretError),
}

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Job '{0}' not found")]
    NotFound(String),

    #[error("Invalid status transition for job '{id}': {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Lease on job '{id}' was lost to another worker")]
    LeaseLost { id: String },

    #[error("Invalid resume pointer '{0}'")]
    InvalidResumePointer(String),

    #[error("Invalid job request: {0}")]
    InvalidRequest(String),

    #[error("Stored job '{id}' is corrupt: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("Worker channel closed unexpectedly")]
    ChannelClosed,

    #[error("Continuation queue error: {0}")]
    Queue(#[from] crate::db::DatabaseError),
}

pub type Result<T> = std::result::Result<T, CascadeError>;
