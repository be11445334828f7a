pub mod clock;
pub mod collaborator;
pub mod config;
pub mod db;
pub mod error;
pub mod guard;
pub mod job;
pub mod linker;
pub mod logging;
pub mod orchestrator;
pub mod parse;
pub mod planner;
pub mod poller;
pub mod preflight;
pub mod progress;
pub mod queue;
pub mod retry;
pub mod sanitize;
pub mod secrets;
pub mod store;
pub mod sweeper;
pub mod trigger;
pub mod unit;
pub mod worker;
pub mod writer;

pub use clock::{Clock, ManualClock, SystemClock};
pub use collaborator::{CollaboratorError, Generator, HttpGenerator};
pub use config::{load_config, Config};
pub use db::{Database, DatabaseError};
pub use error::{CascadeError, ConfigError, JobError, Result, WorkerError};
pub use job::{JobRecord, JobRecordStore, JobStatus, NewJob, ResumePointer};
pub use orchestrator::{
    InvokeRequest, InvokeResponse, Orchestrator, OrchestratorBuilder, OrchestratorSettings,
    ResponseStatus,
};
pub use poller::{HttpStatusSource, JobPoller, PollError, PollSchedule, PollUpdate, StatusSource};
pub use progress::{JobProgressBroadcaster, JobProgressEvent, ProgressReporter};
pub use queue::ContinuationQueue;
pub use secrets::{resolve_secret, resolve_secret_optional, SecretError};
pub use store::{ContentRecord, ContentStore, SqliteContentStore};
pub use sweeper::{SweepReport, Sweeper};
pub use trigger::{ContinuationTrigger, HttpTrigger, NoopTrigger, QueueTrigger};
pub use unit::{Dimension, UnitKey};
pub use worker::{WorkerOutcome, WorkerPool};
