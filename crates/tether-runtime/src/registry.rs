//! Registry of tracked background tasks
//!
//! [`TaskRegistry::submit`] starts an operation, ties its cancellation to
//! the application lifetime, and keeps a weak reference to it until it
//! finishes. [`TaskRegistry::wait_for_all`] gives shutdown a bounded drain:
//! whatever is still running at the deadline is cancelled and reported.

use crate::lifetime::Lifetime;
use crate::pool::WorkerPool;
use crate::task::{self, TaskHandle, Tracked};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tether_core::{CancelSource, CancelToken, LinkedSource, TaskError, TaskId};

static GLOBAL: Lazy<TaskRegistry> = Lazy::new(TaskRegistry::new);

/// Identity of a tracked task for reporting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskLabel {
    /// Unique task id
    pub id: TaskId,
    /// Name given at submission, if any
    pub name: Option<String>,
}

impl fmt::Display for TaskLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => f.write_str(name),
            None => write!(f, "{}", self.id),
        }
    }
}

/// Receives faults of tracked tasks
///
/// Called on the thread that finished the task. Cancellation is not a
/// fault and never reaches the hook.
pub trait FaultHook: Send + Sync {
    /// Handle a faulted task
    fn on_fault(&self, task: &TaskLabel, error: &TaskError);
}

/// Fault hook that logs at error level
#[derive(Debug, Default, Clone, Copy)]
pub struct LogFaultHook;

impl FaultHook for LogFaultHook {
    fn on_fault(&self, task: &TaskLabel, error: &TaskError) {
        tracing::error!(task = %task, id = task.id.as_u64(), %error, "background task faulted");
    }
}

/// Outcome of [`TaskRegistry::wait_for_all`]
#[derive(Debug, Clone)]
pub struct DrainReport {
    /// Tasks still running when the drain started that finished before the deadline
    ///
    /// Tasks that had already finished when the drain started are not counted.
    pub completed: usize,
    /// Tasks still running at the deadline; each was asked to cancel
    pub stragglers: Vec<TaskLabel>,
    /// Time spent waiting
    pub elapsed: Duration,
}

impl DrainReport {
    /// True if every tracked task finished in time
    pub fn is_clean(&self) -> bool {
        self.stragglers.is_empty()
    }
}

struct TrackedTask {
    label: TaskLabel,
    task: Weak<dyn Tracked>,
    link: Option<LinkedSource>,
}

struct RegistryInner {
    tasks: Mutex<FxHashMap<TaskId, TrackedTask>>,
    fault_hook: Arc<dyn FaultHook>,
}

impl RegistryInner {
    fn finished(&self, id: TaskId, outcome: &task::Outcome) {
        let entry = self.tasks.lock().remove(&id);
        let Some(entry) = entry else {
            return;
        };

        // Releases the lifetime link
        drop(entry.link);

        match outcome {
            Err(error) if !error.is_cancelled() => self.fault_hook.on_fault(&entry.label, error),
            Err(_) => tracing::debug!(task = %entry.label, "background task cancelled"),
            Ok(()) => tracing::trace!(task = %entry.label, "background task completed"),
        }
    }
}

/// Tracks background tasks until they finish
#[derive(Clone)]
pub struct TaskRegistry {
    inner: Arc<RegistryInner>,
}

impl TaskRegistry {
    /// Create an empty registry that logs faults
    pub fn new() -> Self {
        Self::with_fault_hook(Arc::new(LogFaultHook))
    }

    /// Create an empty registry reporting faults to `hook`
    pub fn with_fault_hook(hook: Arc<dyn FaultHook>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                tasks: Mutex::new(FxHashMap::default()),
                fault_hook: hook,
            }),
        }
    }

    /// Process-wide registry
    pub fn global() -> &'static TaskRegistry {
        &GLOBAL
    }

    /// Start an operation and track it until it finishes
    ///
    /// If `lifetime` has a stopping signal distinct from `token`, `start`
    /// receives a token that fires when either does; otherwise it receives
    /// `token` unchanged. The returned handle is the one `start` produced.
    pub fn submit<T, S>(
        &self,
        start: S,
        name: Option<&str>,
        lifetime: Option<&dyn Lifetime>,
        token: CancelToken,
    ) -> TaskHandle<T>
    where
        T: Send + 'static,
        S: FnOnce(CancelToken) -> TaskHandle<T>,
    {
        let link = lifetime
            .map(|lifetime| lifetime.stopping())
            .filter(|stopping| !stopping.is_none() && !stopping.same_as(&token))
            .map(|stopping| LinkedSource::new(&[&token, &stopping]));

        let composed = match &link {
            Some(link) => link.token(),
            None => token,
        };

        let handle = start(composed);
        let id = handle.id();
        let label = TaskLabel {
            id,
            name: name.map(str::to_string),
        };

        {
            let mut tasks = self.inner.tasks.lock();
            if tasks.contains_key(&id) {
                tracing::warn!(task = %label, "task is already tracked");
                return handle;
            }
            tasks.insert(
                id,
                TrackedTask {
                    label,
                    task: handle.tracker(),
                    link,
                },
            );
        }

        let registry = Arc::downgrade(&self.inner);
        handle.on_complete(move |outcome| {
            if let Some(registry) = registry.upgrade() {
                registry.finished(id, outcome);
            }
        });

        handle
    }

    /// Run `f` on the shared pool as a tracked task
    pub fn run<T, F>(
        &self,
        f: F,
        name: Option<&str>,
        lifetime: Option<&dyn Lifetime>,
        token: CancelToken,
    ) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(CancelToken) -> Result<T, TaskError> + Send + 'static,
    {
        self.run_on(&WorkerPool::shared(), f, name, lifetime, token)
    }

    /// Run `f` on `pool` as a tracked task
    pub fn run_on<T, F>(
        &self,
        pool: &WorkerPool,
        f: F,
        name: Option<&str>,
        lifetime: Option<&dyn Lifetime>,
        token: CancelToken,
    ) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(CancelToken) -> Result<T, TaskError> + Send + 'static,
    {
        self.submit(move |token| task::spawn_on(pool, token, f), name, lifetime, token)
    }

    /// Wait up to `timeout` for every currently tracked task to finish
    ///
    /// Tasks submitted after the call starts are not waited for. Tasks
    /// still running at the deadline have their cancellation sources
    /// cancelled and are returned as stragglers.
    pub fn wait_for_all(&self, timeout: Duration) -> DrainReport {
        let started = Instant::now();
        let snapshot = self.snapshot();
        if snapshot.is_empty() {
            return DrainReport {
                completed: 0,
                stragglers: Vec::new(),
                elapsed: started.elapsed(),
            };
        }

        let deadline = started + timeout;
        let mut completed = 0;
        let mut stragglers = Vec::new();
        for (label, task, link) in snapshot {
            if task.wait_until(deadline) {
                completed += 1;
                continue;
            }
            if let Some(source) = task.cancel_source() {
                source.cancel();
            }
            if let Some(source) = link {
                source.cancel();
            }
            tracing::warn!(task = %label, "background task still running at shutdown deadline; cancelled");
            stragglers.push(label);
        }

        DrainReport {
            completed,
            stragglers,
            elapsed: started.elapsed(),
        }
    }

    fn snapshot(&self) -> Vec<(TaskLabel, Arc<dyn Tracked>, Option<CancelSource>)> {
        let tasks = self.inner.tasks.lock();
        let mut live: Vec<_> = tasks
            .values()
            .filter_map(|entry| {
                let task = entry.task.upgrade()?;
                if task.is_completed() {
                    return None;
                }
                let link = entry.link.as_ref().map(|link| link.source().clone());
                Some((entry.label.clone(), task, link))
            })
            .collect();
        live.sort_by_key(|(label, _, _)| label.id);
        live
    }

    /// Number of tracked tasks
    pub fn len(&self) -> usize {
        self.inner.tasks.lock().len()
    }

    /// True if nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.inner.tasks.lock().is_empty()
    }

    /// Labels of tracked tasks, oldest first
    pub fn tracked(&self) -> Vec<TaskLabel> {
        let mut labels: Vec<_> = self
            .inner
            .tasks
            .lock()
            .values()
            .map(|entry| entry.label.clone())
            .collect();
        labels.sort_by_key(|label| label.id);
        labels
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tracked", &self.len())
            .finish()
    }
}
