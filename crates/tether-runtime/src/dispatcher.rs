//! Bounded-concurrency dispatcher
//!
//! A [`BoundedDispatcher`] runs callbacks on a shared [`WorkerPool`] but lets
//! at most `max_concurrency` of them execute at once. Admission goes through
//! an [`AdmissionGate`]; waiters are admitted in arrival order.

use crate::context::{self, ContextRef, DispatchContext};
use crate::pool::WorkerPool;
use crate::scheduler::Scheduler;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tether_core::{
    AdmissionGate, PendingItem, ScheduleError, ScheduleResult, WorkItem, WorkItemId,
};

struct DispatcherInner {
    /// Admission gate bounding concurrent callbacks
    gate: AdmissionGate,

    /// Pool the posted callbacks run on
    pool: Arc<WorkerPool>,

    /// Callbacks currently executing
    in_flight: AtomicUsize,

    /// Posted callbacks still waiting for a permit
    pending: Mutex<FxHashMap<WorkItemId, PendingItem>>,
}

impl DispatcherInner {
    fn execute(&self, item: WorkItem) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let _in_flight = InFlight(&self.in_flight);
        item.run();
    }
}

/// Decrements the in-flight counter on every exit path
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Dispatch context that bounds how many callbacks run at once
///
/// Cloning shares the same bound.
#[derive(Clone)]
pub struct BoundedDispatcher {
    name: String,
    inner: Arc<DispatcherInner>,
}

impl BoundedDispatcher {
    /// Create a dispatcher on the shared pool
    pub fn new(max_concurrency: usize) -> ScheduleResult<Self> {
        Self::with_pool(max_concurrency, WorkerPool::shared())
    }

    /// Create a dispatcher on a specific pool
    pub fn with_pool(max_concurrency: usize, pool: Arc<WorkerPool>) -> ScheduleResult<Self> {
        if max_concurrency == 0 {
            return Err(ScheduleError::InvalidConcurrency(max_concurrency));
        }
        Ok(Self {
            name: format!("tether-bounded-{}", max_concurrency),
            inner: Arc::new(DispatcherInner {
                gate: AdmissionGate::new(max_concurrency),
                pool,
                in_flight: AtomicUsize::new(0),
                pending: Mutex::new(FxHashMap::default()),
            }),
        })
    }

    /// Run `action` through a fresh dispatcher installed as the current context
    pub fn run<F>(max_concurrency: usize, action: F) -> ScheduleResult<()>
    where
        F: FnOnce(&ContextRef) + Send + 'static,
    {
        let dispatcher: ContextRef = Arc::new(Self::new(max_concurrency)?);
        context::run(dispatcher, action)
    }

    /// Number of callbacks executing right now
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Number of callers and posted callbacks waiting for admission
    pub fn waiting(&self) -> usize {
        self.inner.gate.waiting_count()
    }

    /// Get the admission gate
    pub fn gate(&self) -> &AdmissionGate {
        &self.inner.gate
    }
}

impl DispatchContext for BoundedDispatcher {
    /// Blocks for a permit, then runs inline on the calling thread
    fn send(&self, item: WorkItem) -> ScheduleResult<()> {
        let _permit = self.inner.gate.acquire();
        self.inner.execute(item);
        Ok(())
    }

    /// Waits for a permit without blocking, then runs on the pool
    fn post(&self, item: WorkItem) {
        let id = item.id();
        self.inner.pending.lock().insert(id, item.describe());

        let inner = self.inner.clone();
        self.inner.gate.acquire_then(move |permit| {
            inner.pending.lock().remove(&id);
            let pool = inner.pool.clone();
            pool.execute(move || {
                // Held until the callback returns or unwinds
                let _permit = permit;
                inner.execute(item);
            });
        });
    }

    fn max_concurrency(&self) -> usize {
        self.inner.gate.max_permits()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Scheduler for BoundedDispatcher {
    fn schedule(&self, item: WorkItem) {
        self.post(item);
    }

    /// Runs inline only if a permit is free right now
    fn try_execute_inline(&self, item: WorkItem) -> Result<(), WorkItem> {
        match self.inner.gate.try_acquire() {
            Some(_permit) => {
                self.inner.execute(item);
                Ok(())
            }
            None => Err(item),
        }
    }

    fn list_pending(&self) -> Vec<PendingItem> {
        let mut pending: Vec<_> = self.inner.pending.lock().values().cloned().collect();
        pending.sort_by_key(|p| p.id);
        pending
    }

    fn max_concurrency(&self) -> usize {
        self.inner.gate.max_permits()
    }
}

impl fmt::Debug for BoundedDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedDispatcher")
            .field("max_concurrency", &self.inner.gate.max_permits())
            .field("in_flight", &self.in_flight())
            .field("waiting", &self.waiting())
            .finish()
    }
}
