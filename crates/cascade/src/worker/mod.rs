pub mod pool;

pub use pool::{WorkerOutcome, WorkerPool};
