//! Serial executor — run jobs one at a time, in order, on one background thread.

pub mod config;
pub mod error;
pub mod executor;
pub mod queue;

pub use config::ExecutorConfig;
pub use error::{ConfigError, Error, ExecutorError, JobError, QueueError, Result};
pub use executor::{
    ExecutorEvent, ExecutorState, ExecutorStats, JobFault, JobHandle, JobOptions, JobState,
    SerialExecutor, Step,
};
pub use queue::CircularQueue;
