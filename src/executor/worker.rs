//! The single worker loop.
//!
//! Submitters only ever touch `pending`, under a lock held for one enqueue.
//! The worker swaps `pending` out under that same lock and runs jobs from its
//! private `active` queue with no lock held, so a job may itself submit.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::config::{ExecutorConfig, MIN_IDLE_SLEEP};
use crate::executor::events::{EventBus, JobFault};
use crate::executor::job::{Job, RunOutcome};
use crate::executor::state::{AtomicExecutorState, ExecutorState};
use crate::queue::CircularQueue;

/// Snapshot of executor counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorStats {
    /// Jobs accepted by `submit*`.
    pub submitted: u64,
    /// Jobs that finished executing, successfully or not.
    pub executed: u64,
    pub completed: u64,
    pub faulted: u64,
    /// Times a job reported "not yet runnable".
    pub deferred: u64,
    /// Idle waits taken with nothing to run.
    pub idle_sleeps: u64,
    pub loop_iterations: u64,
    /// Drains that moved at least one job from pending to active.
    pub drains: u64,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    executed: AtomicU64,
    completed: AtomicU64,
    faulted: AtomicU64,
    deferred: AtomicU64,
    idle_sleeps: AtomicU64,
    loop_iterations: AtomicU64,
    drains: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Counters {
    fn snapshot(&self) -> ExecutorStats {
        ExecutorStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            executed: self.executed.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            faulted: self.faulted.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            idle_sleeps: self.idle_sleeps.load(Ordering::Relaxed),
            loop_iterations: self.loop_iterations.load(Ordering::Relaxed),
            drains: self.drains.load(Ordering::Relaxed),
        }
    }
}

/// State shared between the executor front-end and its worker thread.
pub(crate) struct Shared {
    pub(crate) config: ExecutorConfig,
    pub(crate) state: AtomicExecutorState,
    pending: Mutex<CircularQueue<Job>>,
    /// Signalled on submit and stop request; the idle wait parks on it.
    wake: Condvar,
    /// Set once the worker has fired its closed notifications.
    finished: Mutex<bool>,
    finished_cv: Condvar,
    pub(crate) events: EventBus,
    counters: Counters,
    worker: OnceLock<ThreadId>,
}

impl Shared {
    pub(crate) fn new(config: ExecutorConfig) -> Self {
        let events = EventBus::new(config.event_capacity);
        Self {
            config,
            state: AtomicExecutorState::new(ExecutorState::NotStarted),
            pending: Mutex::new(CircularQueue::new()),
            wake: Condvar::new(),
            finished: Mutex::new(false),
            finished_cv: Condvar::new(),
            events,
            counters: Counters::default(),
            worker: OnceLock::new(),
        }
    }

    // Jobs run outside these locks and their panics are caught, so a poisoned
    // guard still protects consistent data.
    fn lock_pending(&self) -> MutexGuard<'_, CircularQueue<Job>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a job unless the executor stopped accepting work.
    ///
    /// The state is checked under the pending lock so it cannot race with
    /// the worker's final empty check.
    pub(crate) fn push(&self, job: Job) -> Result<(), (Job, ExecutorState)> {
        let mut pending = self.lock_pending();
        let state = self.state.load();
        if !state.accepts_jobs() {
            return Err((job, state));
        }
        pending.enqueue(job);
        // Counted before the worker can see the job, so `executed <= submitted`.
        bump(&self.counters.submitted);
        drop(pending);
        self.wake.notify_one();
        Ok(())
    }

    /// Wake the worker out of an idle wait.
    pub(crate) fn wake(&self) {
        let _pending = self.lock_pending();
        self.wake.notify_one();
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.lock_pending().len()
    }

    pub(crate) fn stats(&self) -> ExecutorStats {
        self.counters.snapshot()
    }

    pub(crate) fn is_worker_thread(&self) -> bool {
        self.worker.get() == Some(&thread::current().id())
    }

    /// Block until the worker finished, or until `deadline`.
    pub(crate) fn wait_finished(&self, deadline: Option<Instant>) -> bool {
        let mut finished = self.finished.lock().unwrap_or_else(PoisonError::into_inner);
        while !*finished {
            finished = match deadline {
                None => self
                    .finished_cv
                    .wait(finished)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    self.finished_cv
                        .wait_timeout(finished, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
        true
    }

    /// Swap the pending queue with `inbox` (which must be empty).
    fn drain_into(&self, inbox: &mut CircularQueue<Job>) {
        debug_assert!(inbox.is_empty());
        let mut pending = self.lock_pending();
        if !pending.is_empty() {
            std::mem::swap(&mut *pending, inbox);
        }
    }

    /// Transition `Closing -> Closed` if no job arrived since the last drain.
    fn try_close(&self) -> bool {
        let pending = self.lock_pending();
        if !pending.is_empty() {
            return false;
        }
        self.state
            .transition(ExecutorState::Closing, ExecutorState::Closed)
            .is_ok()
    }

    /// Park for up to `duration`, returning early once work arrives or the
    /// state moves on. Spurious wakeups do not shorten the wait.
    fn idle_wait(&self, duration: Duration, entered: ExecutorState) {
        bump(&self.counters.idle_sleeps);
        let deadline = Instant::now() + duration.max(MIN_IDLE_SLEEP);
        let mut pending = self.lock_pending();
        while pending.is_empty() && self.state.load() == entered {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            pending = self
                .wake
                .wait_timeout(pending, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Close after the worker loop unwound. Jobs still pending are abandoned.
    fn close_after_panic(&self) {
        let orphaned = {
            let mut pending = self.lock_pending();
            let previous = self.state.force(ExecutorState::Closed);
            error!(
                name = %self.config.name,
                state = %previous,
                pending = pending.len(),
                "Executor worker panicked, closing"
            );
            std::mem::take(&mut *pending)
        };
        // Already unwinding; a second panic here would abort.
        if panic::catch_unwind(AssertUnwindSafe(move || drop(orphaned))).is_err() {
            warn!("Abandoned job panicked while being dropped");
        }
        self.events.closed(self.stats());
    }

    fn mark_finished(&self) {
        let mut finished = self.finished.lock().unwrap_or_else(PoisonError::into_inner);
        *finished = true;
        self.finished_cv.notify_all();
    }
}

/// Releases [`Shared::wait_finished`] when the worker returns or unwinds.
struct FinishGuard<'a>(&'a Shared);

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.close_after_panic();
        }
        self.0.mark_finished();
    }
}

/// Worker thread entry point.
pub(crate) fn run(shared: &Shared) {
    // Declared before the queues so it drops after them.
    let _finish = FinishGuard(shared);
    let _ = shared.worker.set(thread::current().id());
    info!(
        name = %shared.config.name,
        idle_sleep_ms = shared.config.idle_sleep.as_millis() as u64,
        "Executor worker started"
    );

    let mut active: CircularQueue<Job> = CircularQueue::new();
    let mut inbox: CircularQueue<Job> = CircularQueue::new();

    loop {
        bump(&shared.counters.loop_iterations);

        shared.drain_into(&mut inbox);
        if !inbox.is_empty() {
            bump(&shared.counters.drains);
            debug!(drained = inbox.len(), queued = active.len(), "Drained pending jobs");
            active.append(&mut inbox);
        }

        if !active.is_empty() && run_batch(shared, &mut active) {
            continue;
        }

        let state = shared.state.load();
        if active.is_empty() {
            if state == ExecutorState::Closing && shared.try_close() {
                break;
            }
            if state == ExecutorState::Closing {
                // Something was queued before the stop; drain it without waiting.
                thread::yield_now();
                continue;
            }
        }
        // Idle, or every queued job is waiting on something external.
        shared.idle_wait(shared.config.idle_sleep, state);
    }

    let stats = shared.stats();
    info!(
        name = %shared.config.name,
        executed = stats.executed,
        faulted = stats.faulted,
        "Executor closed"
    );
    shared.events.closed(stats);
}

/// Run every job currently in `active` once, in order.
///
/// Deferred jobs go back on the tail. Returns `true` if at least one job
/// finished, `false` if every job deferred.
fn run_batch(shared: &Shared, active: &mut CircularQueue<Job>) -> bool {
    let batch = active.len();
    let mut progressed = false;

    for _ in 0..batch {
        let Some(mut job) = active.try_dequeue() else {
            break;
        };

        let finished = match job.run() {
            RunOutcome::Completed => {
                trace!(job_id = %job.id(), label = ?job.label(), "Job completed");
                bump(&shared.counters.executed);
                bump(&shared.counters.completed);
                Some(job)
            }
            RunOutcome::Faulted(error) => {
                warn!(job_id = %job.id(), label = ?job.label(), error = %error, "Job faulted");
                bump(&shared.counters.executed);
                bump(&shared.counters.faulted);
                shared.events.job_faulted(JobFault {
                    job_id: job.id(),
                    label: job.label().map(str::to_string),
                    error,
                });
                Some(job)
            }
            RunOutcome::Deferred => {
                debug!(job_id = %job.id(), label = ?job.label(), "Job not ready, deferred");
                bump(&shared.counters.deferred);
                active.enqueue(job);
                None
            }
        };

        if let Some(job) = finished {
            progressed = true;
            if let Err(error) = job.retire() {
                warn!(error = %error, "Job panicked while being dropped");
            }
        }

        thread::yield_now();
    }

    progressed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::job::{JobOptions, Step};

    fn ok_job(value: u32) -> (Job, crate::executor::JobHandle<u32>) {
        Job::once(JobOptions::new(), move || Ok::<_, anyhow::Error>(value))
    }

    #[test]
    fn push_rejected_once_closing() {
        let shared = Shared::new(ExecutorConfig::default());
        let (job, _handle) = ok_job(1);
        assert!(shared.push(job).is_ok());
        assert_eq!(shared.pending_len(), 1);

        shared.state.transition(ExecutorState::NotStarted, ExecutorState::Running).unwrap();
        shared.state.transition(ExecutorState::Running, ExecutorState::Closing).unwrap();

        let (job, _handle) = ok_job(2);
        let (_job, state) = shared.push(job).unwrap_err();
        assert_eq!(state, ExecutorState::Closing);
        assert_eq!(shared.stats().submitted, 1);
    }

    #[test]
    fn drain_moves_everything() {
        let shared = Shared::new(ExecutorConfig::default());
        let handles: Vec<_> = (0..3)
            .map(|i| {
                let (job, handle) = ok_job(i);
                shared.push(job).unwrap();
                handle
            })
            .collect();

        let mut inbox = CircularQueue::new();
        shared.drain_into(&mut inbox);
        assert_eq!(inbox.len(), 3);
        assert_eq!(shared.pending_len(), 0);
        let ids: Vec<_> = inbox.iter().map(Job::id).collect();
        assert_eq!(ids, handles.iter().map(|h| h.id()).collect::<Vec<_>>());
    }

    #[test]
    fn batch_defers_without_losing_order() {
        let shared = Shared::new(ExecutorConfig::default());
        let mut active = CircularQueue::new();

        let (first, first_handle) = ok_job(1);
        let mut ready = false;
        let (waiting, waiting_handle) = Job::poll(JobOptions::new(), move || {
            if ready {
                Step::Ready(Ok::<_, anyhow::Error>(2))
            } else {
                ready = true;
                Step::NotReady
            }
        });
        let (last, last_handle) = ok_job(3);
        active.extend([first, waiting, last]);

        assert!(run_batch(&shared, &mut active));
        assert_eq!(active.len(), 1);
        assert_eq!(first_handle.try_get_result(), Some(1));
        assert_eq!(last_handle.try_get_result(), Some(3));
        assert!(!waiting_handle.is_completed());

        assert!(run_batch(&shared, &mut active));
        assert!(active.is_empty());
        assert_eq!(waiting_handle.try_get_result(), Some(2));

        let stats = shared.stats();
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.deferred, 1);
    }

    #[test]
    fn batch_of_only_deferrals_reports_no_progress() {
        let shared = Shared::new(ExecutorConfig::default());
        let mut active = CircularQueue::new();
        let (job, _handle) =
            Job::poll(JobOptions::new(), || Step::<Result<(), anyhow::Error>>::NotReady);
        active.enqueue(job);

        assert!(!run_batch(&shared, &mut active));
        assert_eq!(active.len(), 1);
    }

    struct PanicsOnDrop;

    impl Drop for PanicsOnDrop {
        fn drop(&mut self) {
            panic!("dropped a PanicsOnDrop");
        }
    }

    #[test]
    fn batch_survives_panicking_result_drop() {
        let shared = Shared::new(ExecutorConfig::default());
        let mut active = CircularQueue::new();

        let (bomb, bomb_handle) =
            Job::once(JobOptions::new(), || Ok::<_, anyhow::Error>(PanicsOnDrop));
        drop(bomb_handle);
        let (next, next_handle) = ok_job(9);
        active.extend([bomb, next]);

        assert!(run_batch(&shared, &mut active));
        assert!(active.is_empty());
        assert_eq!(next_handle.try_get_result(), Some(9));
        assert_eq!(shared.stats().completed, 2);
    }

    fn crash() {
        panic!("worker loop bug");
    }

    #[test]
    fn unwinding_worker_closes_and_releases_waiters() {
        let shared = std::sync::Arc::new(Shared::new(ExecutorConfig::default()));
        shared.state.transition(ExecutorState::NotStarted, ExecutorState::Running).unwrap();
        let (queued, queued_handle) = ok_job(1);
        shared.push(queued).unwrap();

        let worker = {
            let shared = std::sync::Arc::clone(&shared);
            thread::spawn(move || {
                let _finish = FinishGuard(&shared);
                crash();
            })
        };
        assert!(worker.join().is_err());

        assert!(shared.wait_finished(Some(Instant::now() + Duration::from_secs(2))));
        assert_eq!(shared.state.load(), ExecutorState::Closed);
        assert_eq!(shared.pending_len(), 0);
        assert!(matches!(queued_handle.error(), Some(crate::error::JobError::Abandoned { .. })));

        let (late, _late_handle) = ok_job(2);
        assert!(shared.push(late).is_err());
    }

    #[test]
    fn zero_idle_wait_still_parks() {
        let shared = Shared::new(ExecutorConfig::default());
        shared.state.transition(ExecutorState::NotStarted, ExecutorState::Running).unwrap();
        let started = Instant::now();
        shared.idle_wait(Duration::ZERO, ExecutorState::Running);
        assert!(started.elapsed() >= MIN_IDLE_SLEEP);
    }

    #[test]
    fn idle_wait_returns_early_on_submit() {
        let shared = std::sync::Arc::new(Shared::new(ExecutorConfig::default()));
        shared.state.transition(ExecutorState::NotStarted, ExecutorState::Running).unwrap();

        let submitter = {
            let shared = std::sync::Arc::clone(&shared);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                let (job, handle) = ok_job(1);
                shared.push(job).unwrap();
                handle
            })
        };

        let started = Instant::now();
        shared.idle_wait(Duration::from_secs(10), ExecutorState::Running);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(shared.pending_len(), 1);
        drop(submitter.join().unwrap());
    }
}
