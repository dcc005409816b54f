//! Task Scheduler
//!
//! Accepts units of work and runs them either on the worker pool or on the
//! main execution context. The pool is an owned multi-threaded tokio runtime;
//! synchronous closures run on its blocking threads so they never stall the
//! async workers used by probes and timers.

mod handle;
mod main_context;

pub use handle::{SchedulerStats, TaskHandle, TaskId, TaskState, Work};
pub use main_context::{MainContext, MainQueue};

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use tokio::runtime::{Handle, Runtime};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};
use viabridge_core::{BridgeResult, SchedulerConfig, SchedulerError, TaskError};

use handle::{DriverGuard, Job, SchedulerCounters, TaskShared};

// ----------------------------------------------------------------------------
// Scheduler State
// ----------------------------------------------------------------------------

struct SchedulerInner {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    closed: AtomicBool,
    main: RwLock<Option<MainContext>>,
    counters: Arc<SchedulerCounters>,
    next_id: AtomicU64,
}

impl SchedulerInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn new_shared(&self) -> Arc<TaskShared> {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        TaskShared::new(id, self.counters.clone())
    }

    fn main_context(&self) -> Option<MainContext> {
        self.main
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn dispatch_async(&self, job: Job) {
        // If the runtime is already gone the closure is dropped and the job
        // resolves as cancelled.
        let _ = self.handle.spawn_blocking(move || job.run());
    }

    fn dispatch_main(&self, job: Job) {
        let job = match self.main_context() {
            Some(context) => match context.enqueue(job) {
                Ok(()) => return,
                Err(job) => {
                    debug!(task = %job.id(), "Main context closed, running on the worker pool");
                    job
                }
            },
            None => job,
        };
        self.dispatch_async(job);
    }

    fn shutdown_runtime(&self) {
        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
        }
    }
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        self.shutdown_runtime();
    }
}

// ----------------------------------------------------------------------------
// Task Scheduler
// ----------------------------------------------------------------------------

/// Runs work on the worker pool or the main execution context
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
}

impl TaskScheduler {
    /// Build the worker pool and start accepting work
    pub fn start(config: &SchedulerConfig) -> BridgeResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.worker_threads)
            .max_blocking_threads(config.max_blocking_threads)
            .thread_name(config.thread_name.clone())
            .enable_all()
            .build()?;

        info!(
            workers = config.worker_threads,
            "Started task scheduler worker pool"
        );

        Ok(Self {
            inner: Arc::new(SchedulerInner {
                handle: runtime.handle().clone(),
                runtime: Mutex::new(Some(runtime)),
                closed: AtomicBool::new(false),
                main: RwLock::new(None),
                counters: Arc::new(SchedulerCounters::default()),
                next_id: AtomicU64::new(1),
            }),
        })
    }

    fn check_open(&self) -> Result<(), SchedulerError> {
        if self.inner.is_closed() {
            Err(SchedulerError::Closed)
        } else {
            Ok(())
        }
    }

    fn new_job<F>(&self, work: F) -> (Job, TaskHandle)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let shared = self.inner.new_shared();
        let handle = TaskHandle::new(shared.clone());
        (Job::new(shared, Box::new(work)), handle)
    }

    /// Run `work` on the worker pool
    pub fn submit_async<F>(&self, work: F) -> Result<TaskHandle, SchedulerError>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.check_open()?;
        let (job, handle) = self.new_job(work);
        self.inner.dispatch_async(job);
        Ok(handle)
    }

    /// Run `work` on the main context, or on the pool when there is none
    pub fn submit_main_context<F>(&self, work: F) -> Result<TaskHandle, SchedulerError>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.check_open()?;
        let (job, handle) = self.new_job(work);
        self.inner.dispatch_main(job);
        Ok(handle)
    }

    /// Synchronous-context submission. Same routing as [`Self::submit_main_context`].
    pub fn submit_sync<F>(&self, work: F) -> Result<TaskHandle, SchedulerError>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.submit_main_context(work)
    }

    /// Run `work` on the main context once `delay` has elapsed
    pub fn submit_delayed<F>(&self, work: F, delay: Duration) -> Result<TaskHandle, SchedulerError>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.check_open()?;
        let (job, handle) = self.new_job(work);
        let weak = Arc::downgrade(&self.inner);

        self.inner.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.dispatch_main(job);
            }
        });
        Ok(handle)
    }

    /// Run `work` on the main context every `period`, starting immediately.
    ///
    /// The returned handle tracks the repetition itself: it stays `Running`
    /// until cancelled. Each iteration is a separate unit of work, so a
    /// failing iteration is logged and the next one still runs. A tick is
    /// skipped while the previous iteration is still queued or running, and
    /// a queued iteration never starts once the repetition is cancelled.
    pub fn submit_repeating<F>(&self, work: F, period: Duration) -> Result<TaskHandle, SchedulerError>
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.check_open()?;
        let shared = self.inner.new_shared();
        let handle = TaskHandle::new(shared.clone());
        let weak: Weak<SchedulerInner> = Arc::downgrade(&self.inner);
        let work = Arc::new(work);

        self.inner.handle.spawn(async move {
            let guard = DriverGuard::new(shared);
            if !guard.shared().try_start() {
                return;
            }

            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut previous: Option<Arc<TaskShared>> = None;
            loop {
                ticker.tick().await;
                if guard.shared().is_cancel_requested() {
                    break;
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if inner.is_closed() {
                    break;
                }
                if previous
                    .as_ref()
                    .is_some_and(|last| !last.state().is_terminal())
                {
                    debug!(task = %guard.shared().id(), "Previous iteration still pending, skipping tick");
                    continue;
                }

                let iteration = inner.new_shared();
                previous = Some(iteration.clone());
                let work = work.clone();
                inner.dispatch_main(Job::iteration_of(
                    guard.shared().clone(),
                    iteration,
                    Box::new(move || work()),
                ));
            }

            if let Some(last) = previous {
                last.cancel_unstarted();
            }
            debug!(task = %guard.shared().id(), "Repeating task stopped");
            guard.shared().complete(Err(TaskError::Cancelled));
        });
        Ok(handle)
    }

    /// Run a future on the worker pool
    pub fn spawn_future<F>(&self, future: F) -> Result<JoinHandle<F::Output>, SchedulerError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.check_open()?;
        Ok(self.inner.handle.spawn(future))
    }

    /// Install the main context; returns the one it replaces
    pub fn attach_main_context(&self, context: MainContext) -> Option<MainContext> {
        debug!(context = %context.name(), "Main context attached to scheduler");
        self.inner
            .main
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(context)
    }

    /// Remove the main context; later main-context work runs on the pool
    pub fn detach_main_context(&self) -> Option<MainContext> {
        self.inner
            .main
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    pub fn main_context(&self) -> Option<MainContext> {
        self.inner.main_context()
    }

    /// Whether the calling thread is the main context
    pub fn is_main_context(&self) -> bool {
        self.inner
            .main_context()
            .is_some_and(|context| context.is_current())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.inner.counters.snapshot()
    }

    /// Reject new work without tearing the pool down yet
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    /// Reject new work and stop the pool.
    ///
    /// Work already running on blocking threads finishes in the background;
    /// queued work that never started resolves as cancelled.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            debug!("Scheduler already closed");
        }
        self.inner.shutdown_runtime();
        info!("Task scheduler shut down");
    }
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("closed", &self.is_closed())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use viabridge_core::BridgeConfig;

    const WAIT: Duration = Duration::from_secs(5);

    fn scheduler() -> TaskScheduler {
        TaskScheduler::start(&BridgeConfig::testing().scheduler).expect("Failed to start scheduler")
    }

    #[test]
    fn test_submit_async_runs_off_caller_thread() {
        let scheduler = scheduler();
        let caller = std::thread::current().id();
        let ran_on = Arc::new(Mutex::new(None));

        let slot = ran_on.clone();
        let handle = scheduler
            .submit_async(move || {
                *slot.lock().expect("lock") = Some(std::thread::current().id());
                Ok(())
            })
            .expect("Failed to submit");

        assert!(matches!(handle.wait_timeout(WAIT), Some(Ok(()))));
        let ran_on = ran_on.lock().expect("lock").expect("work did not record a thread");
        assert_ne!(ran_on, caller);
    }

    #[test]
    fn test_failed_work_does_not_poison_pool() {
        let scheduler = scheduler();

        let failed = scheduler
            .submit_async(|| Err(anyhow::anyhow!("broken")))
            .expect("Failed to submit");
        let panicked = scheduler
            .submit_async(|| panic!("worker panic"))
            .expect("Failed to submit");
        assert!(matches!(
            failed.wait_timeout(WAIT),
            Some(Err(TaskError::Failed { .. }))
        ));
        assert!(matches!(
            panicked.wait_timeout(WAIT),
            Some(Err(TaskError::Failed { .. }))
        ));

        let healthy = scheduler.submit_async(|| Ok(())).expect("Failed to submit");
        assert!(matches!(healthy.wait_timeout(WAIT), Some(Ok(()))));

        let stats = scheduler.stats();
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.completed, 1);
    }

    #[test]
    fn test_main_context_runs_in_submission_order() {
        let scheduler = scheduler();
        let context = MainContext::spawn("order-main").expect("Failed to spawn main context");
        scheduler.attach_main_context(context.clone());

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..50 {
            let order = order.clone();
            handles.push(
                scheduler
                    .submit_main_context(move || {
                        order.lock().expect("lock").push(i);
                        Ok(())
                    })
                    .expect("Failed to submit"),
            );
        }
        for handle in &handles {
            assert!(handle.wait_timeout(WAIT).is_some());
        }

        assert_eq!(*order.lock().expect("lock"), (0..50).collect::<Vec<_>>());
        context.close();
    }

    #[test]
    fn test_submit_sync_without_main_context_uses_pool() {
        let scheduler = scheduler();
        assert!(scheduler.main_context().is_none());

        let handle = scheduler.submit_sync(|| Ok(())).expect("Failed to submit");
        assert!(matches!(handle.wait_timeout(WAIT), Some(Ok(()))));
    }

    #[test]
    fn test_closed_main_context_falls_back_to_pool() {
        let scheduler = scheduler();
        let (context, _queue) = MainContext::attach("closed-main");
        scheduler.attach_main_context(context.clone());
        context.close();

        let handle = scheduler
            .submit_main_context(|| Ok(()))
            .expect("Failed to submit");
        assert!(matches!(handle.wait_timeout(WAIT), Some(Ok(()))));
    }

    #[test]
    fn test_cancel_queued_main_context_work() {
        let scheduler = scheduler();
        let (context, mut queue) = MainContext::attach("manual-main");
        scheduler.attach_main_context(context);

        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let handle = scheduler
            .submit_main_context(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .expect("Failed to submit");

        assert_eq!(handle.state(), TaskState::Pending);
        assert!(handle.cancel());
        assert_eq!(queue.run_pending(), 1);

        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(handle.state(), TaskState::Cancelled);
        assert!(!handle.cancel());
    }

    #[test]
    fn test_is_main_context() {
        let scheduler = scheduler();
        assert!(!scheduler.is_main_context());

        let (context, mut queue) = MainContext::attach("manual-main");
        scheduler.attach_main_context(context);
        assert!(scheduler.is_main_context());

        let observed = Arc::new(AtomicBool::new(true));
        let flag = observed.clone();
        let worker_view = scheduler.clone();
        let handle = scheduler
            .submit_async(move || {
                flag.store(worker_view.is_main_context(), Ordering::SeqCst);
                Ok(())
            })
            .expect("Failed to submit");
        assert!(handle.wait_timeout(WAIT).is_some());
        assert!(!observed.load(Ordering::SeqCst));
        assert_eq!(queue.run_pending(), 0);

        assert!(scheduler.detach_main_context().is_some());
        assert!(!scheduler.is_main_context());
    }

    #[test]
    fn test_submit_delayed_waits() {
        let scheduler = scheduler();
        let started = std::time::Instant::now();
        let handle = scheduler
            .submit_delayed(|| Ok(()), Duration::from_millis(100))
            .expect("Failed to submit");

        assert!(matches!(handle.wait_timeout(WAIT), Some(Ok(()))));
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn test_cancel_delayed_before_it_fires() {
        let scheduler = scheduler();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let handle = scheduler
            .submit_delayed(
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                Duration::from_millis(200),
            )
            .expect("Failed to submit");

        assert!(handle.cancel());
        std::thread::sleep(Duration::from_millis(400));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(handle.state(), TaskState::Cancelled);
    }

    #[test]
    fn test_repeating_until_cancelled() {
        let scheduler = scheduler();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let handle = scheduler
            .submit_repeating(
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                Duration::from_millis(20),
            )
            .expect("Failed to submit");

        let deadline = std::time::Instant::now() + WAIT;
        while runs.load(Ordering::SeqCst) < 3 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(runs.load(Ordering::SeqCst) >= 3);
        assert_eq!(handle.state(), TaskState::Running);

        assert!(!handle.cancel());
        assert!(matches!(
            handle.wait_timeout(WAIT),
            Some(Err(TaskError::Cancelled))
        ));

        std::thread::sleep(Duration::from_millis(50));
        let settled = runs.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(runs.load(Ordering::SeqCst), settled);
    }

    #[test]
    fn test_cancelled_repetition_drops_queued_iteration() {
        let scheduler = scheduler();
        let (context, mut queue) = MainContext::attach("host-loop");
        scheduler.attach_main_context(context);

        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let handle = scheduler
            .submit_repeating(
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                Duration::from_millis(30),
            )
            .expect("Failed to submit");

        let deadline = std::time::Instant::now() + WAIT;
        while queue.is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(queue.len(), 1);

        // Undrained queue: later ticks wait for the first iteration.
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(queue.len(), 1);

        handle.cancel();
        assert!(matches!(
            handle.wait_timeout(WAIT),
            Some(Err(TaskError::Cancelled))
        ));
        assert_eq!(queue.run_pending(), 1);

        assert_eq!(runs.load(Ordering::SeqCst), 0);
        let stats = scheduler.stats();
        assert_eq!(stats.submitted, 2);
        assert_eq!(stats.cancelled, 2);
    }

    #[test]
    fn test_closed_scheduler_rejects_work() {
        let scheduler = scheduler();
        scheduler.shutdown();

        assert!(scheduler.is_closed());
        assert_eq!(
            scheduler.submit_async(|| Ok(())).err(),
            Some(SchedulerError::Closed)
        );
        assert_eq!(
            scheduler.submit_main_context(|| Ok(())).err(),
            Some(SchedulerError::Closed)
        );
        assert!(scheduler.spawn_future(async {}).is_err());
    }

    #[tokio::test]
    async fn test_join_from_async_caller() {
        let scheduler = scheduler();
        let handle = scheduler.submit_async(|| Ok(())).expect("Failed to submit");
        let outcome = tokio::time::timeout(WAIT, handle.join())
            .await
            .expect("join timed out");
        assert!(outcome.is_ok());
    }
}
