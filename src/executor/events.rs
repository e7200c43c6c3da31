//! Fault and shutdown notifications.
//!
//! Two delivery paths: observers registered with `on_fault` / `on_closed` run
//! inline on the worker thread, and every event is also broadcast to
//! `subscribe()` receivers.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

use crate::error::JobError;
use crate::executor::worker::ExecutorStats;

/// A job that returned an error or panicked.
#[derive(Debug, Clone)]
pub struct JobFault {
    pub job_id: Uuid,
    pub label: Option<String>,
    pub error: JobError,
}

/// Events published by the executor.
#[derive(Debug, Clone)]
pub enum ExecutorEvent {
    /// A job faulted. Emitted once per faulting job.
    JobFaulted(JobFault),
    /// The executor reached `Closed`. Emitted once, last.
    Closed(ExecutorStats),
}

impl ExecutorEvent {
    /// Event kind name, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::JobFaulted(_) => "job_faulted",
            Self::Closed(_) => "closed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}

/// Serializable summary of a fault, for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct FaultSummary {
    pub job_id: Uuid,
    pub label: Option<String>,
    pub panicked: bool,
    pub message: String,
}

impl From<&JobFault> for FaultSummary {
    fn from(fault: &JobFault) -> Self {
        Self {
            job_id: fault.job_id,
            label: fault.label.clone(),
            panicked: fault.error.is_panic(),
            message: fault.error.to_string(),
        }
    }
}

type FaultObserver = Arc<dyn Fn(&JobFault) + Send + Sync>;
type ClosedObserver = Arc<dyn Fn(&ExecutorStats) + Send + Sync>;

/// Observer lists plus the broadcast sender.
pub(crate) struct EventBus {
    tx: broadcast::Sender<ExecutorEvent>,
    fault_observers: RwLock<Vec<FaultObserver>>,
    closed_observers: RwLock<Vec<ClosedObserver>>,
}

impl EventBus {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            fault_observers: RwLock::new(Vec::new()),
            closed_observers: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ExecutorEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn on_fault(&self, observer: FaultObserver) {
        self.fault_observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    pub(crate) fn on_closed(&self, observer: ClosedObserver) {
        self.closed_observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    pub(crate) fn job_faulted(&self, fault: JobFault) {
        // Snapshot so observers may register further observers without deadlocking.
        let observers = self
            .fault_observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in observers {
            if panic::catch_unwind(AssertUnwindSafe(|| observer(&fault))).is_err() {
                warn!(job_id = %fault.job_id, "Fault observer panicked");
            }
        }
        // Ok if nobody is subscribed.
        let _ = self.tx.send(ExecutorEvent::JobFaulted(fault));
    }

    pub(crate) fn closed(&self, stats: ExecutorStats) {
        let observers = self
            .closed_observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in observers {
            if panic::catch_unwind(AssertUnwindSafe(|| observer(&stats))).is_err() {
                warn!("Closed observer panicked");
            }
        }
        let _ = self.tx.send(ExecutorEvent::Closed(stats));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fault() -> JobFault {
        let job_id = Uuid::new_v4();
        JobFault {
            job_id,
            label: Some("flaky".into()),
            error: JobError::failed(job_id, anyhow::anyhow!("timeout")),
        }
    }

    #[test]
    fn observers_and_subscribers_see_faults() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        bus.on_fault(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let fault = fault();
        let job_id = fault.job_id;
        bus.job_faulted(fault);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        match rx.try_recv().unwrap() {
            ExecutorEvent::JobFaulted(f) => assert_eq!(f.job_id, job_id),
            other => panic!("Expected JobFaulted, got {}", other.kind()),
        }
    }

    #[test]
    fn panicking_observer_does_not_stop_delivery() {
        let bus = EventBus::new(8);
        let calls = Arc::new(AtomicUsize::new(0));
        bus.on_fault(Arc::new(|_| panic!("observer bug")));
        let counter = Arc::clone(&calls);
        bus.on_fault(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        bus.job_faulted(fault());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn closed_event_is_terminal() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.closed(ExecutorStats::default());
        let event = rx.try_recv().unwrap();
        assert!(event.is_terminal());
        assert_eq!(event.kind(), "closed");
    }

    #[test]
    fn fault_summary_serializes() {
        let summary = FaultSummary::from(&fault());
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["label"], "flaky");
        assert_eq!(json["panicked"], false);
    }
}
