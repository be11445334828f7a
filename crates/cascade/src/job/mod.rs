pub mod record;
pub mod store;

pub use record::{
    DimensionStatus, FailureKind, JobRecord, JobSpec, JobStatus, NewJob, Progress, ResumePointer,
    UnitFailure,
};
pub use store::{Checkpoint, JobRecordStore, Lease};
