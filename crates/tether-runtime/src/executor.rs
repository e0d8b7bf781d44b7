//! Single-thread affine executor
//!
//! An [`AffineExecutor`] owns exactly one dedicated thread and runs every
//! work item on it, one at a time, in queue order. Callers already on that
//! thread can skip the queue with `try_execute_inline`.
//!
//! Lifecycle:
//! - `Running -> wait() -> Draining -> Stopped`: queued work finishes first
//! - `Running -> dispose() -> Stopped`: queued work is abandoned

use crate::context::{self, ContextRef, DispatchContext};
use crate::scheduler::Scheduler;
use crossbeam::channel;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use tether_core::{
    CancelSource, PendingItem, ScheduleError, ScheduleResult, TaskError, WorkItem, WorkQueue,
};

type InitAction = Box<dyn FnOnce() + Send + 'static>;

/// Construction options for an [`AffineExecutor`]
pub struct ExecutorOptions {
    /// Name of the dedicated thread
    pub name: String,

    /// Stack size of the dedicated thread (None = platform default)
    pub stack_size: Option<usize>,

    /// Action run on the dedicated thread before it starts consuming work
    pub init: Option<InitAction>,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            name: "tether-affine".to_string(),
            stack_size: None,
            init: None,
        }
    }
}

impl ExecutorOptions {
    /// Default options with the given thread name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set the action run on the thread before the consume loop
    pub fn with_init<F>(mut self, init: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.init = Some(Box::new(init));
        self
    }

    /// Set the thread's stack size
    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }
}

impl fmt::Debug for ExecutorOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorOptions")
            .field("name", &self.name)
            .field("stack_size", &self.stack_size)
            .field("init", &self.init.is_some())
            .finish()
    }
}

/// Lifecycle state of an executor
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExecutorState {
    /// Accepting and running work
    Running,
    /// `wait` was called; queued work is finishing
    Draining,
    /// No longer accepting work; the thread has exited or is exiting
    Stopped,
}

struct Lifecycle {
    state: ExecutorState,
    handle: Option<JoinHandle<()>>,
}

/// State shared between the executor handle and its thread
struct ExecutorShared {
    /// Thread name
    name: String,

    /// Pending work
    queue: WorkQueue,

    /// Fired by dispose (and at the end of wait); ends the consume loop
    stop: CancelSource,

    /// The dedicated thread, set once
    owner: OnceCell<ThreadId>,

    /// Lifecycle state and the thread handle `wait` joins
    lifecycle: Mutex<Lifecycle>,
}

impl ExecutorShared {
    fn is_owner_thread(&self) -> bool {
        self.owner.get() == Some(&thread::current().id())
    }

    fn is_disposed(&self) -> bool {
        self.stop.is_cancelled()
    }

    fn schedule(&self, item: WorkItem) {
        if self.is_disposed() {
            tracing::trace!(executor = %self.name, "dropping work scheduled after dispose");
            return;
        }
        self.queue.try_enqueue(item);
    }

    fn try_execute_inline(&self, item: WorkItem) -> Result<(), WorkItem> {
        if !self.is_owner_thread() || self.is_disposed() {
            return Err(item);
        }
        item.run();
        Ok(())
    }

    fn dispose(&self) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state == ExecutorState::Stopped {
                return;
            }
            lifecycle.state = ExecutorState::Stopped;
            // The thread is left to exit on its own
            lifecycle.handle.take();
        }
        // Cancelled first so the worker's next dequeue fails before it can pop
        self.stop.cancel();
        self.queue.complete();
        tracing::debug!(executor = %self.name, "affine executor disposed");
    }

    /// Consume loop of the dedicated thread
    fn run_loop(self: Arc<Self>, init: Option<InitAction>) {
        self.owner.get_or_init(|| thread::current().id());
        let _current = context::enter(self.clone());

        if let Some(init) = init {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(init)) {
                let error = TaskError::from_panic(payload.as_ref());
                tracing::error!(executor = %self.name, %error, "init action panicked; executor will not run work");
                self.queue.close_and_clear();
                return;
            }
        }

        let token = self.stop.token();
        loop {
            match self.queue.dequeue(&token) {
                Ok(Some(item)) => self.execute(item),
                Ok(None) => break,
                Err(ScheduleError::Cancelled) => break,
                Err(e) => {
                    tracing::error!(executor = %self.name, error = %e, "work queue failed");
                    break;
                }
            }
        }

        let abandoned = self.queue.close_and_clear();
        tracing::debug!(executor = %self.name, abandoned, "affine executor thread exiting");
    }

    /// Run one item, containing any panic it raises
    fn execute(&self, item: WorkItem) {
        let id = item.id();
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| item.run())) {
            let error = TaskError::from_panic(payload.as_ref());
            tracing::warn!(executor = %self.name, item = id.as_u64(), %error, "work item panicked");
        }
    }
}

impl DispatchContext for ExecutorShared {
    /// Runs inline on the owner thread; from any other thread the item is
    /// marshalled to the owner thread and the caller blocks until it ran
    fn send(&self, item: WorkItem) -> ScheduleResult<()> {
        if self.is_disposed() {
            return Err(ScheduleError::Closed);
        }
        if self.is_owner_thread() {
            item.run();
            return Ok(());
        }

        let (done_tx, done_rx) = channel::bounded::<thread::Result<()>>(1);
        let label = item.label().map(str::to_string);
        let mut marshalled = WorkItem::from_fn(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| item.run()));
            let _ = done_tx.send(result);
        });
        if let Some(label) = label {
            marshalled = marshalled.with_label(label);
        }
        self.queue.enqueue(marshalled)?;

        // The sender is dropped unrun if the executor abandons its queue
        match done_rx.recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(payload)) => panic::resume_unwind(payload),
            Err(_) => Err(ScheduleError::Closed),
        }
    }

    fn post(&self, item: WorkItem) {
        self.schedule(item);
    }

    fn max_concurrency(&self) -> usize {
        1
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Scheduler backed by one dedicated thread
///
/// Dropping the executor disposes it.
pub struct AffineExecutor {
    shared: Arc<ExecutorShared>,
}

impl AffineExecutor {
    /// Start an executor with the given options
    ///
    /// The dedicated thread starts immediately; this does not wait for it
    /// to reach its consume loop.
    pub fn new(options: ExecutorOptions) -> ScheduleResult<Self> {
        let ExecutorOptions {
            name,
            stack_size,
            init,
        } = options;

        let shared = Arc::new(ExecutorShared {
            name: name.clone(),
            queue: WorkQueue::new(),
            stop: CancelSource::new(),
            owner: OnceCell::new(),
            lifecycle: Mutex::new(Lifecycle {
                state: ExecutorState::Running,
                handle: None,
            }),
        });

        let mut builder = thread::Builder::new().name(name);
        if let Some(bytes) = stack_size {
            builder = builder.stack_size(bytes);
        }

        let thread_shared = shared.clone();
        let handle = builder.spawn(move || thread_shared.run_loop(init))?;

        shared.owner.get_or_init(|| handle.thread().id());
        shared.lifecycle.lock().handle = Some(handle);
        tracing::debug!(executor = %shared.name, "affine executor started");

        Ok(Self { shared })
    }

    /// Start an executor with default options and the given thread name
    pub fn named(name: impl Into<String>) -> ScheduleResult<Self> {
        Self::new(ExecutorOptions::named(name))
    }

    /// Get the executor's name
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Get the id of the dedicated thread
    pub fn owner_thread(&self) -> Option<ThreadId> {
        self.shared.owner.get().copied()
    }

    /// Get the current lifecycle state
    pub fn state(&self) -> ExecutorState {
        self.shared.lifecycle.lock().state
    }

    /// Check whether the calling thread is the executor's thread
    pub fn is_owner_thread(&self) -> bool {
        self.shared.is_owner_thread()
    }

    /// Get this executor as a dispatch context
    pub fn context(&self) -> ContextRef {
        self.shared.clone()
    }

    /// Queue `item` to run on the executor's thread
    ///
    /// Best effort: after `dispose` or `wait` the item is silently dropped.
    pub fn schedule(&self, item: WorkItem) {
        self.shared.schedule(item);
    }

    /// Queue a plain closure
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(WorkItem::from_fn(f));
    }

    /// Run `item` now if called from the executor's thread and not disposed
    pub fn try_execute_inline(&self, item: WorkItem) -> Result<(), WorkItem> {
        self.shared.try_execute_inline(item)
    }

    /// Describe queued work, oldest first
    pub fn list_pending(&self) -> Vec<PendingItem> {
        self.shared.queue.snapshot()
    }

    /// Stop accepting work, let queued work finish, and join the thread
    ///
    /// Fails with `AlreadyDisposed` after `dispose` or a previous `wait`, and
    /// with `OwnerThread` when called from the executor's own thread.
    pub fn wait(&self) -> ScheduleResult<()> {
        let handle = {
            let mut lifecycle = self.shared.lifecycle.lock();
            if lifecycle.state != ExecutorState::Running {
                return Err(ScheduleError::AlreadyDisposed(self.shared.name.clone()));
            }
            if self.shared.is_owner_thread() {
                return Err(ScheduleError::OwnerThread(self.shared.name.clone()));
            }
            lifecycle.state = ExecutorState::Draining;
            lifecycle.handle.take()
        };

        self.shared.queue.complete();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!(executor = %self.shared.name, "executor thread panicked");
            }
        }
        self.shared.stop.cancel();
        self.shared.lifecycle.lock().state = ExecutorState::Stopped;
        tracing::debug!(executor = %self.shared.name, "affine executor drained");
        Ok(())
    }

    /// Stop accepting work and abandon whatever is still queued
    ///
    /// Does not wait for the thread. Idempotent, and safe after `wait`.
    pub fn dispose(&self) {
        self.shared.dispose();
    }
}

impl Scheduler for AffineExecutor {
    fn schedule(&self, item: WorkItem) {
        AffineExecutor::schedule(self, item);
    }

    fn try_execute_inline(&self, item: WorkItem) -> Result<(), WorkItem> {
        AffineExecutor::try_execute_inline(self, item)
    }

    fn list_pending(&self) -> Vec<PendingItem> {
        AffineExecutor::list_pending(self)
    }

    fn max_concurrency(&self) -> usize {
        1
    }
}

impl DispatchContext for AffineExecutor {
    fn send(&self, item: WorkItem) -> ScheduleResult<()> {
        self.shared.send(item)
    }

    fn post(&self, item: WorkItem) {
        self.shared.post(item);
    }

    fn max_concurrency(&self) -> usize {
        1
    }

    fn name(&self) -> &str {
        &self.shared.name
    }
}

impl Drop for AffineExecutor {
    fn drop(&mut self) {
        self.shared.dispose();
    }
}

impl fmt::Debug for AffineExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AffineExecutor")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .field("pending", &self.shared.queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_executor_creation() {
        let executor = AffineExecutor::named("test-affine").unwrap();
        assert_eq!(executor.name(), "test-affine");
        assert_eq!(executor.state(), ExecutorState::Running);
        assert!(executor.owner_thread().is_some());
        assert!(!executor.is_owner_thread());
    }

    #[test]
    fn test_init_runs_on_owner_thread_first() {
        let (tx, rx) = channel::unbounded();
        let init_tx = tx.clone();
        let options = ExecutorOptions::named("with-init").with_init(move || {
            init_tx.send(("init", thread::current().id())).unwrap();
        });
        let executor = AffineExecutor::new(options).unwrap();

        executor.spawn(move || {
            tx.send(("work", thread::current().id())).unwrap();
        });
        executor.wait().unwrap();

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0, "init");
        assert_eq!(events[1].0, "work");
        assert_eq!(Some(events[0].1), executor.owner_thread());
        assert_eq!(events[0].1, events[1].1);
    }

    #[test]
    fn test_panicking_item_does_not_kill_loop() {
        let executor = AffineExecutor::named("survivor").unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        executor.spawn(|| panic!("work item failure"));
        let c = counter.clone();
        executor.spawn(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        executor.wait().unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_init_stops_executor() {
        let options = ExecutorOptions::named("bad-init").with_init(|| panic!("init failure"));
        let executor = AffineExecutor::new(options).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        executor.spawn(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        executor.wait().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_wait_twice_fails() {
        let executor = AffineExecutor::named("twice").unwrap();
        executor.wait().unwrap();
        assert_eq!(executor.state(), ExecutorState::Stopped);
        assert!(matches!(
            executor.wait(),
            Err(ScheduleError::AlreadyDisposed(name)) if name == "twice"
        ));
    }

    #[test]
    fn test_wait_after_dispose_fails() {
        let executor = AffineExecutor::named("disposed").unwrap();
        executor.dispose();
        executor.dispose();
        assert!(matches!(
            executor.wait(),
            Err(ScheduleError::AlreadyDisposed(_))
        ));
    }

    #[test]
    fn test_dispose_after_wait_is_noop() {
        let executor = AffineExecutor::named("drained").unwrap();
        executor.wait().unwrap();
        executor.dispose();
        assert_eq!(executor.state(), ExecutorState::Stopped);
    }

    #[test]
    fn test_wait_from_owner_thread_fails() {
        let executor = Arc::new(AffineExecutor::named("self-wait").unwrap());
        let (tx, rx) = channel::bounded(1);
        let inner = executor.clone();
        executor.spawn(move || {
            tx.send(matches!(inner.wait(), Err(ScheduleError::OwnerThread(_))))
                .unwrap();
        });

        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        executor.dispose();
    }

    #[test]
    fn test_inline_from_foreign_thread_returns_item() {
        let executor = AffineExecutor::named("foreign").unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let item = WorkItem::from_fn(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let id = item.id();

        let returned = executor.try_execute_inline(item).unwrap_err();
        assert_eq!(returned.id(), id);
        assert!(executor.list_pending().is_empty());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_send_from_foreign_thread_marshals() {
        let executor = AffineExecutor::named("marshal").unwrap();
        let ran_on = Arc::new(Mutex::new(None));
        let r = ran_on.clone();

        executor
            .context()
            .send(WorkItem::from_fn(move || {
                *r.lock() = Some(thread::current().id());
            }))
            .unwrap();

        assert_eq!(*ran_on.lock(), executor.owner_thread());
    }

    #[test]
    fn test_send_after_dispose_is_closed() {
        let executor = AffineExecutor::named("closed").unwrap();
        executor.dispose();
        assert!(matches!(
            executor.send(WorkItem::from_fn(|| {})),
            Err(ScheduleError::Closed)
        ));
    }

    #[test]
    fn test_current_context_inside_work_is_executor() {
        let executor = AffineExecutor::named("ambient").unwrap();
        let (tx, rx) = channel::bounded(1);
        executor.spawn(move || {
            tx.send(context::current().map(|c| c.name().to_string()))
                .unwrap();
        });

        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("ambient"));
    }

    #[test]
    fn test_list_pending_reports_queued_labels() {
        let executor = AffineExecutor::named("pending").unwrap();
        let (gate_tx, gate_rx) = channel::bounded::<()>(0);
        executor.spawn(move || {
            let _ = gate_rx.recv();
        });
        // Give the thread time to pick up the blocking item
        thread::sleep(Duration::from_millis(50));

        executor.schedule(WorkItem::from_fn(|| {}).with_label("second"));
        executor.schedule(WorkItem::from_fn(|| {}).with_label("third"));

        let labels: Vec<_> = executor
            .list_pending()
            .into_iter()
            .map(|p| p.label.unwrap_or_default())
            .collect();
        assert_eq!(labels, vec!["second".to_string(), "third".to_string()]);

        gate_tx.send(()).unwrap();
        executor.wait().unwrap();
        assert!(executor.list_pending().is_empty());
    }
}
