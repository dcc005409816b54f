//! Task handles
//!
//! Every submission produces a [`TaskHandle`] backed by one shared completion
//! slot. The slot is written exactly once; all observers (async `join`,
//! blocking `wait_timeout`, `outcome` peeks) see the same value.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error};
use viabridge_core::{TaskError, TaskOutcome};

const PENDING: u8 = 0;
const RUNNING: u8 = 1;
const COMPLETED: u8 = 2;
const FAILED: u8 = 3;
const CANCELLED: u8 = 4;

/// Work accepted by the scheduler
pub type Work = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

// ----------------------------------------------------------------------------
// Identifiers and State
// ----------------------------------------------------------------------------

/// Identifier of a scheduled task, unique per scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Lifecycle state of a scheduled task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    fn from_phase(phase: u8) -> Self {
        match phase {
            PENDING => TaskState::Pending,
            RUNNING => TaskState::Running,
            COMPLETED => TaskState::Completed,
            FAILED => TaskState::Failed,
            _ => TaskState::Cancelled,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

// ----------------------------------------------------------------------------
// Counters
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub(crate) struct SchedulerCounters {
    pub(crate) submitted: AtomicU64,
    pub(crate) completed: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) cancelled: AtomicU64,
}

/// Snapshot of scheduler activity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Units of work accepted (repeating tasks count every iteration)
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl SchedulerCounters {
    pub(crate) fn snapshot(&self) -> SchedulerStats {
        SchedulerStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}

// ----------------------------------------------------------------------------
// Shared Completion Slot
// ----------------------------------------------------------------------------

pub(crate) struct TaskShared {
    id: TaskId,
    phase: AtomicU8,
    cancel_requested: AtomicBool,
    outcome: Mutex<Option<TaskOutcome>>,
    completed: Condvar,
    notify: Notify,
    counters: Arc<SchedulerCounters>,
}

impl TaskShared {
    pub(crate) fn new(id: TaskId, counters: Arc<SchedulerCounters>) -> Arc<Self> {
        counters.submitted.fetch_add(1, Ordering::Relaxed);
        Arc::new(Self {
            id,
            phase: AtomicU8::new(PENDING),
            cancel_requested: AtomicBool::new(false),
            outcome: Mutex::new(None),
            completed: Condvar::new(),
            notify: Notify::new(),
            counters,
        })
    }

    fn lock_outcome(&self) -> MutexGuard<'_, Option<TaskOutcome>> {
        self.outcome.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    /// Claim the right to run. Fails if the task was cancelled first.
    pub(crate) fn try_start(&self) -> bool {
        self.phase
            .compare_exchange(PENDING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    /// Record the final outcome. Only the first call has any effect.
    pub(crate) fn complete(&self, outcome: TaskOutcome) -> bool {
        let mut slot = self.lock_outcome();
        if slot.is_some() {
            return false;
        }

        let phase = match &outcome {
            Ok(()) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                COMPLETED
            }
            Err(TaskError::Cancelled) => {
                debug!(task = %self.id, "Task cancelled");
                self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                CANCELLED
            }
            Err(TaskError::Failed { cause }) => {
                error!(task = %self.id, "Scheduled task failed: {:#}", cause);
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                FAILED
            }
        };
        self.phase.store(phase, Ordering::Release);
        *slot = Some(outcome);
        drop(slot);

        self.completed.notify_all();
        self.notify.notify_waiters();
        true
    }

    /// Cancel if the task has not started yet
    pub(crate) fn cancel_unstarted(&self) -> bool {
        let won = self
            .phase
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.complete(Err(TaskError::Cancelled));
        }
        won
    }

    fn request_cancel(&self) -> bool {
        self.cancel_requested.store(true, Ordering::Release);
        self.cancel_unstarted()
    }

    pub(crate) fn state(&self) -> TaskState {
        TaskState::from_phase(self.phase.load(Ordering::Acquire))
    }

    fn outcome(&self) -> Option<TaskOutcome> {
        self.lock_outcome().clone()
    }
}

// ----------------------------------------------------------------------------
// Task Handle
// ----------------------------------------------------------------------------

/// Cancellable handle to one unit of scheduled work
#[derive(Clone)]
pub struct TaskHandle {
    shared: Arc<TaskShared>,
}

impl TaskHandle {
    pub(crate) fn new(shared: Arc<TaskShared>) -> Self {
        Self { shared }
    }

    pub fn id(&self) -> TaskId {
        self.shared.id
    }

    pub fn state(&self) -> TaskState {
        self.shared.state()
    }

    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    /// Request cancellation.
    ///
    /// Returns `true` when the work had not started and now never will.
    /// Running work is not interrupted; completed work keeps its outcome.
    pub fn cancel(&self) -> bool {
        if self.is_done() {
            return false;
        }
        self.shared.request_cancel()
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.shared.is_cancel_requested()
    }

    /// The recorded outcome, if the task has finished
    pub fn outcome(&self) -> Option<TaskOutcome> {
        self.shared.outcome()
    }

    /// Wait asynchronously for the outcome
    pub async fn join(&self) -> TaskOutcome {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(outcome) = self.outcome() {
                return outcome;
            }
            notified.await;
        }
    }

    /// Block the calling thread until the outcome is known or `timeout` passes
    pub fn wait_timeout(&self, timeout: Duration) -> Option<TaskOutcome> {
        let slot = self.shared.lock_outcome();
        let (slot, _) = self
            .shared
            .completed
            .wait_timeout_while(slot, timeout, |outcome| outcome.is_none())
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        slot.clone()
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Jobs
// ----------------------------------------------------------------------------

/// A unit of work travelling to the pool or the main-context queue.
///
/// Dropping a job that never ran resolves its handle as cancelled.
pub(crate) struct Job {
    shared: Arc<TaskShared>,
    work: Option<Work>,
    /// Repeating task this job is one iteration of
    parent: Option<Arc<TaskShared>>,
}

impl Job {
    pub(crate) fn new(shared: Arc<TaskShared>, work: Work) -> Self {
        Self {
            shared,
            work: Some(work),
            parent: None,
        }
    }

    /// One iteration of a repeating task. It never starts once the
    /// repetition has been cancelled or has stopped.
    pub(crate) fn iteration_of(parent: Arc<TaskShared>, shared: Arc<TaskShared>, work: Work) -> Self {
        Self {
            shared,
            work: Some(work),
            parent: Some(parent),
        }
    }

    fn parent_stopped(&self) -> bool {
        self.parent
            .as_ref()
            .is_some_and(|parent| parent.is_cancel_requested() || parent.state().is_terminal())
    }

    pub(crate) fn id(&self) -> TaskId {
        self.shared.id()
    }

    pub(crate) fn run(mut self) {
        let Some(work) = self.work.take() else {
            return;
        };
        if self.parent_stopped() {
            self.shared.cancel_unstarted();
            return;
        }
        if !self.shared.try_start() {
            return;
        }

        let outcome = match catch_unwind(AssertUnwindSafe(work)) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(cause)) => Err(TaskError::failed(cause)),
            Err(panic) => Err(TaskError::failed(anyhow::anyhow!(
                "task panicked: {}",
                panic_message(panic.as_ref())
            ))),
        };
        self.shared.complete(outcome);
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        if self.work.is_some() {
            self.shared.cancel_unstarted();
        }
    }
}

/// Completes a long-running driver task as cancelled if it is dropped early
pub(crate) struct DriverGuard {
    shared: Arc<TaskShared>,
}

impl DriverGuard {
    pub(crate) fn new(shared: Arc<TaskShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<TaskShared> {
        &self.shared
    }
}

impl Drop for DriverGuard {
    fn drop(&mut self) {
        self.shared.complete(Err(TaskError::Cancelled));
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn shared(id: u64) -> Arc<TaskShared> {
        TaskShared::new(TaskId(id), Arc::new(SchedulerCounters::default()))
    }

    #[test]
    fn test_job_runs_and_completes() {
        let slot = shared(1);
        let handle = TaskHandle::new(slot.clone());
        Job::new(slot, Box::new(|| Ok(()))).run();

        assert_eq!(handle.state(), TaskState::Completed);
        assert!(matches!(handle.outcome(), Some(Ok(()))));
    }

    #[test]
    fn test_cancel_before_start_prevents_run() {
        let slot = shared(2);
        let handle = TaskHandle::new(slot.clone());
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let job = Job::new(
            slot,
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        assert!(handle.cancel());
        job.run();

        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(handle.state(), TaskState::Cancelled);
        assert!(matches!(handle.outcome(), Some(Err(TaskError::Cancelled))));
    }

    #[test]
    fn test_cancel_after_completion_is_noop() {
        let slot = shared(3);
        let handle = TaskHandle::new(slot.clone());
        Job::new(slot, Box::new(|| Ok(()))).run();

        assert!(!handle.cancel());
        assert_eq!(handle.state(), TaskState::Completed);
        assert!(matches!(handle.outcome(), Some(Ok(()))));
    }

    #[test]
    fn test_error_and_panic_become_failures() {
        let slot = shared(4);
        let handle = TaskHandle::new(slot.clone());
        Job::new(
            slot,
            Box::new(|| -> anyhow::Result<()> { Err(anyhow::anyhow!("bad input")) }),
        )
        .run();
        match handle.outcome() {
            Some(Err(TaskError::Failed { cause })) => assert_eq!(cause.to_string(), "bad input"),
            other => panic!("unexpected outcome: {:?}", other),
        }

        let slot = shared(5);
        let handle = TaskHandle::new(slot.clone());
        Job::new(slot, Box::new(|| -> anyhow::Result<()> { panic!("exploded") })).run();
        match handle.outcome() {
            Some(Err(TaskError::Failed { cause })) => {
                assert!(cause.to_string().contains("exploded"))
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(handle.state(), TaskState::Failed);
    }

    #[test]
    fn test_iteration_of_cancelled_repetition_never_runs() {
        let parent = shared(10);
        let repetition = TaskHandle::new(parent.clone());
        assert!(parent.try_start());

        let runs = Arc::new(AtomicUsize::new(0));
        let iteration = |id: u64| {
            let counter = runs.clone();
            let slot = shared(id);
            let handle = TaskHandle::new(slot.clone());
            let job = Job::iteration_of(
                parent.clone(),
                slot,
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            );
            (job, handle)
        };

        let (live, live_handle) = iteration(11);
        live.run();
        assert_eq!(live_handle.state(), TaskState::Completed);

        let (queued, queued_handle) = iteration(12);
        assert!(!repetition.cancel());
        queued.run();

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(queued_handle.state(), TaskState::Cancelled);
    }

    #[test]
    fn test_dropped_job_is_cancelled() {
        let slot = shared(6);
        let handle = TaskHandle::new(slot.clone());
        drop(Job::new(slot, Box::new(|| Ok(()))));

        assert_eq!(handle.state(), TaskState::Cancelled);
    }

    #[test]
    fn test_completion_happens_once() {
        let counters = Arc::new(SchedulerCounters::default());
        let slot = TaskShared::new(TaskId(7), counters.clone());
        assert!(slot.complete(Ok(())));
        assert!(!slot.complete(Err(TaskError::Cancelled)));

        let stats = counters.snapshot();
        assert_eq!(stats.submitted, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.cancelled, 0);
    }

    #[test]
    fn test_wait_timeout_returns_none_while_pending() {
        let handle = TaskHandle::new(shared(8));
        assert!(handle.wait_timeout(Duration::from_millis(10)).is_none());
    }

    #[tokio::test]
    async fn test_join_observes_completion_from_other_thread() {
        let slot = shared(9);
        let handle = TaskHandle::new(slot.clone());
        let job = Job::new(slot, Box::new(|| Ok(())));

        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            job.run();
        });

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle.join())
            .await
            .expect("join timed out");
        assert!(outcome.is_ok());
    }
}
