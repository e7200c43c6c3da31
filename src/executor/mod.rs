//! Single-worker sequential executor.
//!
//! Core components:
//! - `state` — executor lifecycle and job state machine
//! - `job` — type-erased units of work, cooperative `Step`
//! - `handle` — caller-side completion handle
//! - `events` — fault / closed notifications
//! - `worker` — the drain-and-run loop on the dedicated thread
//!
//! Jobs run one at a time, in submission order, on one background thread.
//! Submitting never waits for job execution.

pub mod events;
pub mod handle;
pub mod job;
pub mod state;
pub mod worker;

use std::convert::Infallible;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::ExecutorConfig;
use crate::error::ExecutorError;

pub use events::{ExecutorEvent, FaultSummary, JobFault};
pub use handle::{JobHandle, JobInfo};
pub use job::{JobOptions, Step};
pub use state::{ExecutorState, JobState};
pub use worker::ExecutorStats;

use job::Job;
use worker::Shared;

/// Runs submitted jobs sequentially on one dedicated thread.
///
/// Share it across submitter threads with an `Arc`. Jobs may capture a clone
/// of that `Arc` and submit follow-up work.
pub struct SerialExecutor {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SerialExecutor {
    /// Create a stopped executor. Jobs may be queued before [`start`](Self::start).
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            shared: Arc::new(Shared::new(config)),
            thread: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.shared.config
    }

    /// Spawn the worker thread.
    pub fn start(&self) -> Result<(), ExecutorError> {
        self.shared
            .state
            .transition(ExecutorState::NotStarted, ExecutorState::Running)
            .map_err(|_| ExecutorError::AlreadyStarted)?;

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(self.shared.config.name.clone())
            .spawn(move || worker::run(&shared));

        match spawned {
            Ok(handle) => {
                *self.thread.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
                info!(name = %self.shared.config.name, "Executor started");
                Ok(())
            }
            Err(e) => {
                if let Err(state) = self
                    .shared
                    .state
                    .transition(ExecutorState::Running, ExecutorState::NotStarted)
                {
                    warn!(state = %state, "Worker spawn failed after state changed");
                }
                Err(ExecutorError::Spawn(e))
            }
        }
    }

    /// Stop accepting jobs and let the queue drain. In-flight and queued jobs still run.
    pub fn request_stop(&self) -> Result<(), ExecutorError> {
        self.shared
            .state
            .transition(ExecutorState::Running, ExecutorState::Closing)
            .map_err(|state| ExecutorError::InvalidState {
                operation: "request stop",
                state,
            })?;
        info!(
            name = %self.shared.config.name,
            pending = self.shared.pending_len(),
            "Executor stop requested"
        );
        self.shared.wake();
        Ok(())
    }

    /// Block until the executor is closed and its worker has exited.
    ///
    /// Returns `Ok(false)` if the executor was never started. While it is
    /// running this blocks until someone calls [`request_stop`](Self::request_stop).
    pub fn wait(&self) -> Result<bool, ExecutorError> {
        self.wait_until(None)
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`, returning `Ok(false)`.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool, ExecutorError> {
        self.wait_until(Some(Instant::now() + timeout))
    }

    fn wait_until(&self, deadline: Option<Instant>) -> Result<bool, ExecutorError> {
        if self.state() == ExecutorState::NotStarted {
            return Ok(false);
        }
        if self.shared.is_worker_thread() {
            return Err(ExecutorError::WaitFromWorker);
        }
        if !self.shared.wait_finished(deadline) {
            return Ok(false);
        }

        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            warn!(name = %self.shared.config.name, "Executor worker panicked");
        }
        Ok(true)
    }

    /// Queue a closure. Its return value becomes the handle's result; a panic faults the job.
    pub fn submit<F, T>(&self, f: F) -> Result<JobHandle<T>, ExecutorError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.try_submit_with(JobOptions::default(), move || Ok::<T, Infallible>(f()))
    }

    /// [`submit`](Self::submit) with a label for logs and fault events.
    pub fn submit_named<F, T>(
        &self,
        label: impl Into<String>,
        f: F,
    ) -> Result<JobHandle<T>, ExecutorError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.try_submit_with(JobOptions::new().with_label(label), move || {
            Ok::<T, Infallible>(f())
        })
    }

    /// Queue a fallible closure. An `Err` faults the job.
    pub fn try_submit<F, T, E>(&self, f: F) -> Result<JobHandle<T>, ExecutorError>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Into<anyhow::Error> + 'static,
    {
        self.try_submit_with(JobOptions::default(), f)
    }

    pub fn try_submit_with<F, T, E>(
        &self,
        options: JobOptions,
        f: F,
    ) -> Result<JobHandle<T>, ExecutorError>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Into<anyhow::Error> + 'static,
    {
        let (job, handle) = Job::once(options, f);
        self.enqueue(job, handle)
    }

    /// Queue a fallible closure together with the state it is handed when run.
    pub fn submit_with_state<S, F, T, E>(
        &self,
        state: S,
        f: F,
    ) -> Result<JobHandle<T>, ExecutorError>
    where
        S: Send + 'static,
        F: FnOnce(S) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Into<anyhow::Error> + 'static,
    {
        self.try_submit_with(JobOptions::default(), move || f(state))
    }

    /// Queue a cooperative job. Each [`Step::NotReady`] moves it to the back of
    /// the current run-list; it is called again on a later pass.
    pub fn submit_poll<F, T, E>(&self, f: F) -> Result<JobHandle<T>, ExecutorError>
    where
        F: FnMut() -> Step<Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<anyhow::Error> + 'static,
    {
        self.submit_poll_with(JobOptions::default(), f)
    }

    pub fn submit_poll_with<F, T, E>(
        &self,
        options: JobOptions,
        f: F,
    ) -> Result<JobHandle<T>, ExecutorError>
    where
        F: FnMut() -> Step<Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<anyhow::Error> + 'static,
    {
        let (job, handle) = Job::poll(options, f);
        self.enqueue(job, handle)
    }

    fn enqueue<T>(&self, job: Job, handle: JobHandle<T>) -> Result<JobHandle<T>, ExecutorError> {
        match self.shared.push(job) {
            Ok(()) => Ok(handle),
            Err((job, state)) => {
                debug!(job_id = %job.id(), state = %state, "Rejected job submission");
                Err(ExecutorError::Closed)
            }
        }
    }

    pub fn state(&self) -> ExecutorState {
        self.shared.state.load()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ExecutorState::Running
    }

    pub fn is_closing(&self) -> bool {
        self.state() == ExecutorState::Closing
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ExecutorState::Closed
    }

    /// Jobs submitted but not yet picked up by the worker.
    pub fn pending_len(&self) -> usize {
        self.shared.pending_len()
    }

    /// Whether the calling thread is this executor's worker.
    pub fn is_worker_thread(&self) -> bool {
        self.shared.is_worker_thread()
    }

    pub fn stats(&self) -> ExecutorStats {
        self.shared.stats()
    }

    /// Receive every [`ExecutorEvent`] published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutorEvent> {
        self.shared.events.subscribe()
    }

    /// Run `observer` on the worker thread whenever a job faults. Keep it short.
    pub fn on_fault<F>(&self, observer: F)
    where
        F: Fn(&JobFault) + Send + Sync + 'static,
    {
        self.shared.events.on_fault(Arc::new(observer));
    }

    /// Run `observer` on the worker thread once the executor has closed.
    pub fn on_closed<F>(&self, observer: F)
    where
        F: Fn(&ExecutorStats) + Send + Sync + 'static,
    {
        self.shared.events.on_closed(Arc::new(observer));
    }
}

impl Default for SerialExecutor {
    fn default() -> Self {
        Self::new(ExecutorConfig::default())
    }
}

impl Drop for SerialExecutor {
    fn drop(&mut self) {
        // A running worker keeps its own reference to the shared state and
        // drains in the background. Never-started jobs are abandoned with it.
        if self
            .shared
            .state
            .transition(ExecutorState::Running, ExecutorState::Closing)
            .is_ok()
        {
            debug!(name = %self.shared.config.name, "Executor dropped while running, draining");
            self.shared.wake();
        }
    }
}

impl fmt::Debug for SerialExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialExecutor")
            .field("name", &self.shared.config.name)
            .field("state", &self.state())
            .field("pending", &self.pending_len())
            .finish()
    }
}
