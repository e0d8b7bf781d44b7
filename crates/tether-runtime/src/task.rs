//! Handles to asynchronous units of work
//!
//! A [`TaskHandle`] is the consuming side of a one-shot completion cell; the
//! producing side is a [`TaskCompleter`]. The cell records how the work
//! ended (a value, a fault, or cancellation), wakes blocked waiters, and runs
//! registered continuations exactly once.
//!
//! [`spawn`] starts a closure on the shared pool and returns its handle.

use crate::context::{ContextRef, DispatchContext};
use crate::pool::WorkerPool;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tether_core::{CancelSource, CancelToken, LinkedSource, TaskError, TaskId, WorkItem};

/// How a finished task ended, without its value
pub type Outcome = Result<(), TaskError>;

type Continuation = Box<dyn FnOnce(&Outcome) + Send + 'static>;

/// Coarse state of a task
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    /// Not finished yet
    Running,
    /// Finished with a value
    Completed,
    /// Finished with a fault (including abandonment)
    Faulted,
    /// Finished by observing cancellation
    Cancelled,
}

impl TaskStatus {
    fn of(outcome: Option<&Outcome>) -> Self {
        match outcome {
            None => TaskStatus::Running,
            Some(Ok(())) => TaskStatus::Completed,
            Some(Err(TaskError::Cancelled)) => TaskStatus::Cancelled,
            Some(Err(_)) => TaskStatus::Faulted,
        }
    }
}

struct Slot<T> {
    value: Option<T>,
    outcome: Option<Outcome>,
    continuations: Vec<Continuation>,
}

/// Shared completion cell
pub(crate) struct TaskCell<T> {
    id: TaskId,
    slot: Mutex<Slot<T>>,
    done: Condvar,
    cancel: Option<CancelSource>,
}

impl<T> TaskCell<T> {
    fn finish(&self, result: Result<T, TaskError>) {
        let (continuations, outcome) = {
            let mut slot = self.slot.lock();
            if slot.outcome.is_some() {
                return;
            }
            let outcome = match result {
                Ok(value) => {
                    slot.value = Some(value);
                    Ok(())
                }
                Err(e) => Err(e),
            };
            slot.outcome = Some(outcome.clone());
            self.done.notify_all();
            (std::mem::take(&mut slot.continuations), outcome)
        };

        for continuation in continuations {
            run_continuation(self.id, continuation, &outcome);
        }
    }

    fn wake(&self) {
        let _slot = self.slot.lock();
        self.done.notify_all();
    }
}

fn run_continuation(id: TaskId, continuation: Continuation, outcome: &Outcome) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| continuation(outcome))) {
        let error = TaskError::from_panic(payload.as_ref());
        tracing::warn!(task = %id, %error, "task continuation panicked");
    }
}

/// Type-erased view of a task, used by the registry to track it without owning it
pub(crate) trait Tracked: Send + Sync {
    fn is_completed(&self) -> bool;
    fn wait_until(&self, deadline: Instant) -> bool;
    fn cancel_source(&self) -> Option<CancelSource>;
}

impl<T: Send> Tracked for TaskCell<T> {
    fn is_completed(&self) -> bool {
        self.slot.lock().outcome.is_some()
    }

    fn wait_until(&self, deadline: Instant) -> bool {
        let mut slot = self.slot.lock();
        while slot.outcome.is_none() {
            if self.done.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        slot.outcome.is_some()
    }

    fn cancel_source(&self) -> Option<CancelSource> {
        self.cancel.clone()
    }
}

/// Consuming side of a unit of asynchronous work
pub struct TaskHandle<T> {
    cell: Arc<TaskCell<T>>,
}

impl<T: Send + 'static> TaskHandle<T> {
    /// Create a pending task and the completer that finishes it
    pub fn pair() -> (TaskHandle<T>, TaskCompleter<T>) {
        Self::build(None)
    }

    /// Like [`TaskHandle::pair`], exposing `source` as the task's cancellation source
    pub fn pair_cancellable(source: CancelSource) -> (TaskHandle<T>, TaskCompleter<T>) {
        Self::build(Some(source))
    }

    fn build(cancel: Option<CancelSource>) -> (TaskHandle<T>, TaskCompleter<T>) {
        let cell = Arc::new(TaskCell {
            id: TaskId::new(),
            slot: Mutex::new(Slot {
                value: None,
                outcome: None,
                continuations: Vec::new(),
            }),
            done: Condvar::new(),
            cancel,
        });
        (
            TaskHandle { cell: cell.clone() },
            TaskCompleter { cell: Some(cell) },
        )
    }

    /// Create an already-completed task
    pub fn ready(value: T) -> Self {
        let (handle, completer) = Self::pair();
        completer.complete(value);
        handle
    }

    /// Get the task's unique id
    pub fn id(&self) -> TaskId {
        self.cell.id
    }

    /// Get the task's coarse state
    pub fn status(&self) -> TaskStatus {
        TaskStatus::of(self.cell.slot.lock().outcome.as_ref())
    }

    /// Check whether the task has finished, however it ended
    pub fn is_completed(&self) -> bool {
        self.status() != TaskStatus::Running
    }

    /// Get the cancellation source attached to this task, if any
    pub fn cancel_source(&self) -> Option<&CancelSource> {
        self.cell.cancel.as_ref()
    }

    /// Request cancellation through the attached source
    ///
    /// Returns false if the task has no cancellation source.
    pub fn cancel(&self) -> bool {
        match &self.cell.cancel {
            Some(source) => {
                source.cancel();
                true
            }
            None => false,
        }
    }

    /// Register a continuation that runs once the task finishes
    ///
    /// Runs immediately on the calling thread if the task already finished,
    /// otherwise on the thread that finishes it. Panics are logged and
    /// swallowed.
    pub fn on_complete<F>(&self, continuation: F)
    where
        F: FnOnce(&Outcome) + Send + 'static,
    {
        let outcome = {
            let mut slot = self.cell.slot.lock();
            match &slot.outcome {
                Some(outcome) => outcome.clone(),
                None => {
                    slot.continuations.push(Box::new(continuation));
                    return;
                }
            }
        };
        run_continuation(self.cell.id, Box::new(continuation), &outcome);
    }

    /// Register a continuation that is posted to `ctx` once the task finishes
    pub fn on_complete_in<F>(&self, ctx: ContextRef, continuation: F)
    where
        F: FnOnce(&Outcome) + Send + 'static,
    {
        self.on_complete(move |outcome| {
            let outcome = outcome.clone();
            ctx.post(WorkItem::from_fn(move || continuation(&outcome)));
        });
    }

    /// Block until the task finishes or `timeout` elapses
    ///
    /// Returns whether the task finished.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.cell.wait_until(Instant::now() + timeout)
    }

    /// Block until the task finishes and take its result
    pub fn join(self) -> Result<T, TaskError> {
        let mut slot = self.cell.slot.lock();
        while slot.outcome.is_none() {
            self.cell.done.wait(&mut slot);
        }
        Self::take(&mut slot)
    }

    /// Block until the task finishes or `token` fires, whichever comes first
    ///
    /// If `token` fires first this returns `Err(TaskError::Cancelled)` and the
    /// handle is dropped, but the work itself is not stopped: it keeps
    /// running to completion, detached from the caller.
    pub fn join_or_abandon(self, token: &CancelToken) -> Result<T, TaskError> {
        let weak: Weak<TaskCell<T>> = Arc::downgrade(&self.cell);
        let _wake = token.register(move || {
            if let Some(cell) = weak.upgrade() {
                cell.wake();
            }
        });

        let mut slot = self.cell.slot.lock();
        loop {
            if slot.outcome.is_some() {
                return Self::take(&mut slot);
            }
            if token.is_cancelled() {
                tracing::debug!(task = %self.cell.id, "abandoning task on cancellation; work continues detached");
                return Err(TaskError::Cancelled);
            }
            self.cell.done.wait(&mut slot);
        }
    }

    fn take(slot: &mut Slot<T>) -> Result<T, TaskError> {
        match &slot.outcome {
            Some(Ok(())) => slot.value.take().ok_or(TaskError::Abandoned),
            Some(Err(e)) => Err(e.clone()),
            None => Err(TaskError::Abandoned),
        }
    }

    /// Weak, type-erased view for the registry
    pub(crate) fn tracker(&self) -> Weak<dyn Tracked> {
        let cell: Arc<dyn Tracked> = self.cell.clone();
        Arc::downgrade(&cell)
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.cell.id)
            .field("status", &TaskStatus::of(self.cell.slot.lock().outcome.as_ref()))
            .finish()
    }
}

/// Producing side of a unit of asynchronous work
///
/// Dropping a completer that never finished its task faults the task with
/// [`TaskError::Abandoned`], so waiters and continuations always run.
pub struct TaskCompleter<T> {
    cell: Option<Arc<TaskCell<T>>>,
}

impl<T> TaskCompleter<T> {
    /// Finish the task with a value
    pub fn complete(self, value: T) {
        self.finish(Ok(value));
    }

    /// Finish the task with a fault
    pub fn fault(self, message: impl Into<String>) {
        self.finish(Err(TaskError::Faulted(message.into())));
    }

    /// Finish the task as cancelled
    pub fn cancel(self) {
        self.finish(Err(TaskError::Cancelled));
    }

    /// Finish the task with an arbitrary result
    pub fn finish(mut self, result: Result<T, TaskError>) {
        if let Some(cell) = self.cell.take() {
            cell.finish(result);
        }
    }

    /// Get the id of the task this completer finishes
    pub fn id(&self) -> Option<TaskId> {
        self.cell.as_ref().map(|c| c.id)
    }
}

impl<T> Drop for TaskCompleter<T> {
    fn drop(&mut self) {
        if let Some(cell) = self.cell.take() {
            cell.finish(Err(TaskError::Abandoned));
        }
    }
}

/// Run `f` on the shared pool and return a handle to its result
///
/// See [`spawn_on`].
pub fn spawn<T, F>(token: CancelToken, f: F) -> TaskHandle<T>
where
    T: Send + 'static,
    F: FnOnce(CancelToken) -> Result<T, TaskError> + Send + 'static,
{
    spawn_on(&WorkerPool::shared(), token, f)
}

/// Run `f` on `pool` and return a handle to its result
///
/// The handle exposes a cancellation source linked to `token`; `f` receives
/// that source's token. If it already fired when a worker picks the job up,
/// `f` never runs and the task ends as cancelled. A panic in `f` faults the
/// task.
pub fn spawn_on<T, F>(pool: &WorkerPool, token: CancelToken, f: F) -> TaskHandle<T>
where
    T: Send + 'static,
    F: FnOnce(CancelToken) -> Result<T, TaskError> + Send + 'static,
{
    let link = LinkedSource::new(&[&token]);
    let (handle, completer) = TaskHandle::pair_cancellable(link.source().clone());

    pool.execute(move || {
        let token = link.token();
        if token.is_cancelled() {
            completer.cancel();
            return;
        }
        let result = match panic::catch_unwind(AssertUnwindSafe(|| f(token))) {
            Ok(result) => result,
            Err(payload) => Err(TaskError::from_panic(payload.as_ref())),
        };
        // The link is released before continuations run
        drop(link);
        completer.finish(result);
    });

    handle
}
