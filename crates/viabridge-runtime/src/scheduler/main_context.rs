//! Main execution context
//!
//! The single serialized thread on which the simulation may be touched. It is
//! either spawned by the platform ([`MainContext::spawn`]) or bound to a
//! thread the host already owns ([`MainContext::attach`]), in which case the
//! host drains work by calling [`MainQueue::run_pending`] from its own loop.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{JoinHandle, ThreadId};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use viabridge_core::BridgeResult;

use super::handle::Job;

struct MainInner {
    name: String,
    thread_id: ThreadId,
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    discard: Arc<AtomicBool>,
}

/// Run `job`, or drop it unrun (resolving it as cancelled) once aborted
fn run_or_discard(job: Job, discard: &AtomicBool) {
    if discard.load(Ordering::Acquire) {
        drop(job);
    } else {
        job.run();
    }
}

/// Handle to the main execution context. Cheap to clone.
#[derive(Clone)]
pub struct MainContext {
    inner: Arc<MainInner>,
}

impl MainContext {
    /// Spawn a dedicated thread that runs submitted work in FIFO order
    pub fn spawn(name: impl Into<String>) -> BridgeResult<Self> {
        let name = name.into();
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();

        let discard = Arc::new(AtomicBool::new(false));
        let thread_name = name.clone();
        let thread_discard = discard.clone();
        let worker = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                while let Some(job) = receiver.blocking_recv() {
                    run_or_discard(job, &thread_discard);
                }
                debug!(context = %thread_name, "Main context drained");
            })?;

        info!(context = %name, "Spawned main context thread");
        Ok(Self {
            inner: Arc::new(MainInner {
                name,
                thread_id: worker.thread().id(),
                sender: Mutex::new(Some(sender)),
                worker: Mutex::new(Some(worker)),
                discard,
            }),
        })
    }

    /// Bind the main context to the calling thread
    pub fn attach(name: impl Into<String>) -> (Self, MainQueue) {
        let name = name.into();
        let (sender, receiver) = mpsc::unbounded_channel::<Job>();
        let thread_id = std::thread::current().id();
        let discard = Arc::new(AtomicBool::new(false));

        debug!(context = %name, "Attached main context to current thread");
        let context = Self {
            inner: Arc::new(MainInner {
                name,
                thread_id,
                sender: Mutex::new(Some(sender)),
                worker: Mutex::new(None),
                discard: discard.clone(),
            }),
        };
        let queue = MainQueue {
            receiver,
            discard,
            _not_send: PhantomData,
        };
        (context, queue)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether the calling thread is this main context
    pub fn is_current(&self) -> bool {
        std::thread::current().id() == self.inner.thread_id
    }

    /// Whether new work is still accepted
    pub fn is_open(&self) -> bool {
        self.sender().as_ref().is_some_and(|s| !s.is_closed())
    }

    fn sender(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Job>>> {
        self.inner
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue a job. Hands the job back if the context no longer accepts work.
    pub(crate) fn enqueue(&self, job: Job) -> Result<(), Job> {
        match self.sender().as_ref() {
            Some(sender) => sender.send(job).map_err(|rejected| rejected.0),
            None => Err(job),
        }
    }

    /// Stop accepting work. Already queued work still runs.
    ///
    /// For a spawned context this waits for the thread to drain, unless called
    /// from that thread.
    pub fn close(&self) {
        let sender = self.sender().take();
        if sender.is_none() {
            return;
        }
        drop(sender);

        let worker = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(worker) = worker {
            if self.is_current() {
                return;
            }
            if worker.join().is_err() {
                warn!(context = %self.inner.name, "Main context thread panicked");
            }
        }
        debug!(context = %self.inner.name, "Main context closed");
    }

    /// Stop accepting work and cancel everything still queued
    pub fn abort(&self) {
        self.inner.discard.store(true, Ordering::Release);
        self.close();
    }
}

impl std::fmt::Debug for MainContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainContext")
            .field("name", &self.inner.name)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Receiving side of an attached main context.
///
/// Not `Send`: it must be drained on the thread that attached it.
pub struct MainQueue {
    receiver: mpsc::UnboundedReceiver<Job>,
    discard: Arc<AtomicBool>,
    _not_send: PhantomData<*const ()>,
}

impl MainQueue {
    /// Run everything queued so far, in submission order. Returns the count.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.receiver.try_recv() {
            debug!(task = %job.id(), "Running main-context task");
            run_or_discard(job, &self.discard);
            ran += 1;
        }
        ran
    }

    /// Number of queued jobs
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::handle::{SchedulerCounters, TaskHandle, TaskId, TaskShared, TaskState};
    use std::time::Duration;

    fn make_job(id: u64, work: impl FnOnce() -> anyhow::Result<()> + Send + 'static) -> (Job, TaskHandle) {
        let shared = TaskShared::new(TaskId(id), Arc::new(SchedulerCounters::default()));
        (Job::new(shared.clone(), Box::new(work)), TaskHandle::new(shared))
    }

    #[test]
    fn test_attached_context_is_current_thread() {
        let (context, _queue) = MainContext::attach("test-main");
        assert!(context.is_current());

        let remote = context.clone();
        let off_thread = std::thread::spawn(move || remote.is_current())
            .join()
            .expect("Failed to join thread");
        assert!(!off_thread);
    }

    #[test]
    fn test_run_pending_executes_in_order() {
        let (context, mut queue) = MainContext::attach("test-main");
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            let (job, _) = make_job(i, move || {
                order.lock().expect("lock").push(i);
                Ok(())
            });
            assert!(context.enqueue(job).is_ok());
        }

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.run_pending(), 3);
        assert!(queue.is_empty());
        assert_eq!(*order.lock().expect("lock"), vec![0, 1, 2]);
    }

    #[test]
    fn test_spawned_context_runs_on_its_own_thread() {
        let context = MainContext::spawn("spawned-main").expect("Failed to spawn main context");
        let observed = Arc::new(AtomicBool::new(false));

        let check = context.clone();
        let flag = observed.clone();
        let (job, handle) = make_job(1, move || {
            flag.store(check.is_current(), Ordering::SeqCst);
            Ok(())
        });
        assert!(context.enqueue(job).is_ok());

        assert!(handle.wait_timeout(Duration::from_secs(5)).is_some());
        assert!(observed.load(Ordering::SeqCst));
        assert!(!context.is_current());
        context.close();
    }

    #[test]
    fn test_closed_context_hands_job_back() {
        let (context, _queue) = MainContext::attach("test-main");
        context.close();
        assert!(!context.is_open());

        let (job, handle) = make_job(1, || Ok(()));
        let rejected = context.enqueue(job);
        assert!(rejected.is_err());
        drop(rejected);
        assert_eq!(handle.state(), TaskState::Cancelled);
    }

    #[test]
    fn test_dropped_queue_cancels_pending_work() {
        let (context, queue) = MainContext::attach("test-main");
        let (job, handle) = make_job(1, || Ok(()));
        assert!(context.enqueue(job).is_ok());

        drop(queue);
        assert_eq!(handle.state(), TaskState::Cancelled);
        assert!(!context.is_open());
    }

    #[test]
    fn test_abort_cancels_queued_work() {
        let (context, mut queue) = MainContext::attach("test-main");
        let (job, handle) = make_job(1, || Ok(()));
        assert!(context.enqueue(job).is_ok());

        context.abort();
        assert_eq!(queue.run_pending(), 1);
        assert_eq!(handle.state(), TaskState::Cancelled);
    }
}
