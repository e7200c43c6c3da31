//! Executor lifecycle and job state machines.

use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// Lifecycle of a [`SerialExecutor`](super::SerialExecutor).
///
/// `NotStarted -> Running -> Closing -> Closed`, never backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ExecutorState {
    /// Constructed; jobs may be submitted but nothing runs yet.
    NotStarted = 0,
    /// Worker thread is executing jobs.
    Running = 1,
    /// Stop requested; queued jobs drain, new submissions are rejected.
    Closing = 2,
    /// Both queues are empty and the worker has finished.
    Closed = 3,
}

impl ExecutorState {
    /// Whether new jobs may be submitted in this state.
    pub fn accepts_jobs(&self) -> bool {
        matches!(self, Self::NotStarted | Self::Running)
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::NotStarted,
            1 => Self::Running,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

impl std::fmt::Display for ExecutorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotStarted => "not_started",
            Self::Running => "running",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

/// Lock-free cell holding an [`ExecutorState`], shared by submitters and the worker.
#[derive(Debug)]
pub(crate) struct AtomicExecutorState(AtomicU8);

impl AtomicExecutorState {
    pub(crate) fn new(state: ExecutorState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn load(&self) -> ExecutorState {
        ExecutorState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move from `from` to `to`. On failure returns the state actually observed.
    pub(crate) fn transition(
        &self,
        from: ExecutorState,
        to: ExecutorState,
    ) -> Result<(), ExecutorState> {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(ExecutorState::from_u8)
    }

    /// Unconditionally store `to`, returning the previous state.
    pub(crate) fn force(&self, to: ExecutorState) -> ExecutorState {
        ExecutorState::from_u8(self.0.swap(to as u8, Ordering::AcqRel))
    }
}

/// State of a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting in the pending or active queue.
    Pending,
    /// Currently executing on the worker thread.
    Running,
    /// Reported "not yet runnable" and was moved to the back of the run-list.
    Deferred,
    /// Finished normally.
    Completed,
    /// Returned an error or panicked.
    Faulted,
    /// Dropped without ever running.
    Abandoned,
}

impl JobState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: JobState) -> bool {
        use JobState::*;

        matches!(
            (self, target),
            (Pending, Running) | (Pending, Abandoned) |
            (Running, Completed) | (Running, Faulted) | (Running, Deferred) |
            (Deferred, Running) | (Deferred, Abandoned)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Faulted | Self::Abandoned)
    }

    /// Check if the job is still waiting or running.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Deferred => "deferred",
            Self::Completed => "completed",
            Self::Faulted => "faulted",
            Self::Abandoned => "abandoned",
        };
        write!(f, "{s}")
    }
}
