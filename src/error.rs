//! Error types for the serial executor.

use std::sync::Arc;

use uuid::Uuid;

use crate::executor::ExecutorState;

/// Top-level error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Misuse of a [`CircularQueue`](crate::queue::CircularQueue).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Queue is empty")]
    Empty,

    #[error("Index {index} out of range for queue of length {len}")]
    IndexOutOfRange { index: usize, len: usize },
}

/// Lifecycle errors returned synchronously by the executor.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Executor already started")]
    AlreadyStarted,

    #[error("Cannot {operation} while executor is {state}")]
    InvalidState {
        operation: &'static str,
        state: ExecutorState,
    },

    #[error("Executor is closed and no longer accepts jobs")]
    Closed,

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Cannot wait for executor shutdown from its own worker thread")]
    WaitFromWorker,
}

/// Terminal fault captured into a job's handle.
///
/// Cheap to clone so every waiter on a handle sees the same error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} failed: {error}")]
    Failed { id: Uuid, error: Arc<anyhow::Error> },

    #[error("Job {id} panicked: {message}")]
    Panicked { id: Uuid, message: String },

    #[error("Job {id} was dropped before it ran")]
    Abandoned { id: Uuid },
}

impl JobError {
    /// Id of the job that produced this error.
    pub fn job_id(&self) -> Uuid {
        match self {
            Self::Failed { id, .. } | Self::Panicked { id, .. } | Self::Abandoned { id } => *id,
        }
    }

    /// Whether the job panicked rather than returning an error.
    pub fn is_panic(&self) -> bool {
        matches!(self, Self::Panicked { .. })
    }

    /// The error returned by the callable, if the job failed without panicking.
    pub fn cause(&self) -> Option<&anyhow::Error> {
        match self {
            Self::Failed { error, .. } => Some(error.as_ref()),
            _ => None,
        }
    }

    pub(crate) fn failed(id: Uuid, error: impl Into<anyhow::Error>) -> Self {
        Self::Failed {
            id,
            error: Arc::new(error.into()),
        }
    }

    pub(crate) fn from_panic(id: Uuid, payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::Panicked { id, message }
    }
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payload_messages() {
        let id = Uuid::new_v4();
        let err = JobError::from_panic(id, Box::new("boom"));
        assert!(err.is_panic());
        assert_eq!(err.to_string(), format!("Job {id} panicked: boom"));

        let err = JobError::from_panic(id, Box::new(String::from("owned boom")));
        assert!(matches!(err, JobError::Panicked { ref message, .. } if message == "owned boom"));

        let err = JobError::from_panic(id, Box::new(42u32));
        assert!(matches!(
            err,
            JobError::Panicked { ref message, .. } if message == "non-string panic payload"
        ));
    }

    #[test]
    fn failed_error_keeps_source() {
        let id = Uuid::new_v4();
        let err = JobError::failed(id, anyhow::anyhow!("disk full"));
        assert_eq!(err.job_id(), id);
        assert!(!err.is_panic());
        assert!(err.to_string().contains("disk full"));
        assert_eq!(err.cause().map(|e| e.to_string()), Some("disk full".into()));

        let cloned = err.clone();
        assert_eq!(cloned.to_string(), err.to_string());
    }

    #[test]
    fn invalid_state_message() {
        let err = ExecutorError::InvalidState {
            operation: "request stop",
            state: ExecutorState::NotStarted,
        };
        assert_eq!(
            err.to_string(),
            "Cannot request stop while executor is not_started"
        );
    }

    #[test]
    fn top_level_conversion() {
        let err: Error = QueueError::Empty.into();
        assert!(matches!(err, Error::Queue(QueueError::Empty)));
        assert_eq!(err.to_string(), "Queue error: Queue is empty");
    }
}
