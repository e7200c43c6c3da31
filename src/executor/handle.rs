//! Caller-side view of a submitted job.
//!
//! The worker writes the outcome exactly once into a shared [`Completion`];
//! every blocked thread and every awaiting task is released together.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::JobError;
use crate::executor::state::JobState;

/// Point-in-time description of a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: Uuid,
    pub label: Option<String>,
    pub state: JobState,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Number of times the job reported "not yet runnable".
    pub deferrals: u32,
}

struct Slot<T> {
    state: JobState,
    value: Option<T>,
    error: Option<JobError>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    deferrals: u32,
}

/// Shared completion cell between a job and its handle.
pub(crate) struct Completion<T> {
    id: Uuid,
    label: Option<String>,
    submitted_at: DateTime<Utc>,
    slot: Mutex<Slot<T>>,
    done: Condvar,
    notify: Notify,
}

impl<T> Completion<T> {
    pub(crate) fn new(id: Uuid, label: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            id,
            label,
            submitted_at: Utc::now(),
            slot: Mutex::new(Slot {
                state: JobState::Pending,
                value: None,
                error: None,
                started_at: None,
                finished_at: None,
                deferrals: 0,
            }),
            done: Condvar::new(),
            notify: Notify::new(),
        })
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    // Job panics are caught before they can unwind through a held guard,
    // so a poisoned slot still holds consistent data.
    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(slot: &mut Slot<T>, target: JobState) -> bool {
        if !slot.state.can_transition_to(target) {
            return false;
        }
        let now = Utc::now();
        if target == JobState::Running && slot.started_at.is_none() {
            slot.started_at = Some(now);
        }
        if target == JobState::Deferred {
            slot.deferrals += 1;
        }
        if target.is_terminal() {
            slot.finished_at = Some(now);
        }
        slot.state = target;
        true
    }

    pub(crate) fn mark_running(&self) -> bool {
        Self::transition(&mut self.lock(), JobState::Running)
    }

    pub(crate) fn mark_deferred(&self) -> bool {
        Self::transition(&mut self.lock(), JobState::Deferred)
    }

    /// Store the terminal outcome and wake every waiter.
    ///
    /// Returns `false` if the job had already reached a terminal state.
    pub(crate) fn complete(&self, outcome: Result<T, JobError>) -> bool {
        {
            let mut slot = self.lock();
            let target = match &outcome {
                Ok(_) => JobState::Completed,
                Err(JobError::Abandoned { .. }) => JobState::Abandoned,
                Err(_) => JobState::Faulted,
            };
            if !Self::transition(&mut slot, target) {
                return false;
            }
            match outcome {
                Ok(value) => slot.value = Some(value),
                Err(error) => slot.error = Some(error),
            }
        }
        self.done.notify_all();
        self.notify.notify_waiters();
        true
    }

    pub(crate) fn state(&self) -> JobState {
        self.lock().state
    }
}

/// Handle to a job submitted to a [`SerialExecutor`](super::SerialExecutor).
///
/// Share it by reference (or inside an `Arc`) to let several threads wait on
/// the same job; all of them are released when the job finishes.
pub struct JobHandle<T> {
    inner: Arc<Completion<T>>,
}

impl<T> JobHandle<T> {
    pub(crate) fn new(inner: Arc<Completion<T>>) -> Self {
        Self { inner }
    }

    /// Unique id of the job.
    pub fn id(&self) -> Uuid {
        self.inner.id()
    }

    /// Label given at submission, if any.
    pub fn label(&self) -> Option<&str> {
        self.inner.label()
    }

    pub fn state(&self) -> JobState {
        self.inner.state()
    }

    /// Whether the job reached a terminal state.
    pub fn is_completed(&self) -> bool {
        self.state().is_terminal()
    }

    /// Block the calling thread until the job finishes.
    pub fn wait(&self) {
        let mut slot = self.inner.lock();
        while !slot.state.is_terminal() {
            slot = self
                .inner
                .done
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block for at most `timeout`. Returns `true` if the job finished.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut slot = self.inner.lock();
        while !slot.state.is_terminal() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            slot = self
                .inner
                .done
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Wait asynchronously until the job finishes.
    pub async fn completed(&self) {
        loop {
            // Registered before the state check so a completion in between is not missed.
            let notified = self.inner.notify.notified();
            if self.is_completed() {
                return;
            }
            notified.await;
        }
    }

    /// The captured error, if the job faulted or was abandoned.
    pub fn error(&self) -> Option<JobError> {
        self.inner.lock().error.clone()
    }

    /// The result, without blocking. `None` until the job completes successfully.
    pub fn try_get_result(&self) -> Option<T>
    where
        T: Clone,
    {
        self.inner.lock().value.clone()
    }

    /// Block until the job finishes and return a copy of its outcome.
    pub fn result(&self) -> Result<T, JobError>
    where
        T: Clone,
    {
        self.wait();
        let slot = self.inner.lock();
        match (&slot.value, &slot.error) {
            (Some(value), _) => Ok(value.clone()),
            (None, Some(error)) => Err(error.clone()),
            (None, None) => Err(JobError::Abandoned { id: self.id() }),
        }
    }

    /// Block until the job finishes and move its outcome out.
    pub fn join(self) -> Result<T, JobError> {
        self.wait();
        let mut slot = self.inner.lock();
        match slot.value.take() {
            Some(value) => Ok(value),
            None => Err(slot
                .error
                .clone()
                .unwrap_or(JobError::Abandoned { id: self.id() })),
        }
    }

    /// Snapshot of the job's state and timestamps.
    pub fn info(&self) -> JobInfo {
        let slot = self.inner.lock();
        JobInfo {
            id: self.inner.id,
            label: self.inner.label.clone(),
            state: slot.state,
            submitted_at: self.inner.submitted_at,
            started_at: slot.started_at,
            finished_at: slot.finished_at,
            deferrals: slot.deferrals,
        }
    }

    /// Time from first execution to completion (or to now, if still running).
    pub fn elapsed(&self) -> Option<Duration> {
        let info = self.info();
        info.started_at.map(|start| {
            let end = info.finished_at.unwrap_or_else(Utc::now);
            end.signed_duration_since(start)
                .to_std()
                .unwrap_or(Duration::ZERO)
        })
    }
}

impl<T> fmt::Debug for JobHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id())
            .field("label", &self.label())
            .field("state", &self.state())
            .finish()
    }
}
