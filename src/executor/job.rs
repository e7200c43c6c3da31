//! Units of work queued on the executor.
//!
//! A [`Job`] type-erases the caller's closure together with the completion
//! cell of its [`JobHandle`]. Running a job never unwinds into the worker:
//! errors and panics are captured into the handle.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use uuid::Uuid;

use crate::error::JobError;
use crate::executor::handle::{Completion, JobHandle};

/// Result of one attempt of a cooperative job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step<T> {
    /// The job finished with this value.
    Ready(T),
    /// The job cannot make progress yet; move it to the back of the run-list.
    NotReady,
}

/// Per-job submission options.
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    /// Human-readable label used in logs and fault events.
    pub label: Option<String>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// What happened when the worker ran a job once.
#[derive(Debug)]
pub(crate) enum RunOutcome {
    Completed,
    Faulted(JobError),
    Deferred,
}

trait Execute: Send {
    fn execute(&mut self, id: Uuid) -> RunOutcome;

    /// Complete the handle with `Abandoned` if the job never finished.
    fn abandon(&mut self, id: Uuid);
}

/// Run `f`, turning a returned error or a panic into a [`JobError`].
fn guarded<R, T, E>(
    id: Uuid,
    f: impl FnOnce() -> R,
    unwrap: impl FnOnce(R) -> Step<Result<T, E>>,
) -> Step<Result<T, JobError>>
where
    E: Into<anyhow::Error>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(raw) => match unwrap(raw) {
            Step::Ready(Ok(value)) => Step::Ready(Ok(value)),
            Step::Ready(Err(error)) => Step::Ready(Err(JobError::failed(id, error))),
            Step::NotReady => Step::NotReady,
        },
        Err(payload) => Step::Ready(Err(JobError::from_panic(id, payload))),
    }
}

fn settle<T>(completion: &Completion<T>, step: Step<Result<T, JobError>>) -> RunOutcome {
    match step {
        Step::Ready(Ok(value)) => {
            completion.complete(Ok(value));
            RunOutcome::Completed
        }
        Step::Ready(Err(error)) => {
            completion.complete(Err(error.clone()));
            RunOutcome::Faulted(error)
        }
        Step::NotReady => {
            completion.mark_deferred();
            RunOutcome::Deferred
        }
    }
}

/// A job that runs exactly once.
struct OnceJob<F, T> {
    f: Option<F>,
    completion: Arc<Completion<T>>,
}

impl<F, T, E> Execute for OnceJob<F, T>
where
    F: FnOnce() -> Result<T, E> + Send,
    T: Send,
    E: Into<anyhow::Error>,
{
    fn execute(&mut self, id: Uuid) -> RunOutcome {
        let Some(f) = self.f.take() else {
            return RunOutcome::Completed;
        };
        self.completion.mark_running();
        let step = guarded(id, f, Step::Ready);
        settle(&self.completion, step)
    }

    fn abandon(&mut self, id: Uuid) {
        self.completion.complete(Err(JobError::Abandoned { id }));
    }
}

/// A job that may report [`Step::NotReady`] and be retried later.
struct PollJob<F, T> {
    f: F,
    completion: Arc<Completion<T>>,
}

impl<F, T, E> Execute for PollJob<F, T>
where
    F: FnMut() -> Step<Result<T, E>> + Send,
    T: Send,
    E: Into<anyhow::Error>,
{
    fn execute(&mut self, id: Uuid) -> RunOutcome {
        self.completion.mark_running();
        let f = &mut self.f;
        let step = guarded(id, f, |step| step);
        settle(&self.completion, step)
    }

    fn abandon(&mut self, id: Uuid) {
        self.completion.complete(Err(JobError::Abandoned { id }));
    }
}

/// A type-erased job sitting in a queue.
pub(crate) struct Job {
    id: Uuid,
    label: Option<String>,
    body: Box<dyn Execute>,
}

impl Job {
    /// Wrap a closure that runs once.
    pub(crate) fn once<F, T, E>(options: JobOptions, f: F) -> (Self, JobHandle<T>)
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Into<anyhow::Error> + 'static,
    {
        let id = Uuid::new_v4();
        let completion = Completion::new(id, options.label.clone());
        let handle = JobHandle::new(Arc::clone(&completion));
        let body = Box::new(OnceJob {
            f: Some(f),
            completion,
        });
        (
            Self {
                id,
                label: options.label,
                body,
            },
            handle,
        )
    }

    /// Wrap a closure that is polled until it returns [`Step::Ready`].
    pub(crate) fn poll<F, T, E>(options: JobOptions, f: F) -> (Self, JobHandle<T>)
    where
        F: FnMut() -> Step<Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<anyhow::Error> + 'static,
    {
        let id = Uuid::new_v4();
        let completion = Completion::new(id, options.label.clone());
        let handle = JobHandle::new(Arc::clone(&completion));
        let body = Box::new(PollJob { f, completion });
        (
            Self {
                id,
                label: options.label,
                body,
            },
            handle,
        )
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Execute one attempt. Never panics.
    pub(crate) fn run(&mut self) -> RunOutcome {
        self.body.execute(self.id)
    }

    /// Drop a job the worker is done with.
    ///
    /// This may drop the closure's captures and, if the caller already let go
    /// of the handle, the stored result. A panic from either is returned
    /// instead of unwinding.
    pub(crate) fn retire(self) -> Result<(), JobError> {
        let id = self.id;
        panic::catch_unwind(AssertUnwindSafe(move || drop(self)))
            .map_err(|payload| JobError::from_panic(id, payload))
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        self.body.abandon(self.id);
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}
