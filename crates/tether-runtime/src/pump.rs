//! Caller-pumped single-thread dispatch context
//!
//! [`PumpContext::run`] turns the calling thread into a message loop: the
//! entry action runs first, then every posted callback runs on that same
//! thread in FIFO order until [`PumpContext::complete`] is called.

use crate::context::{self, ContextRef, DispatchContext};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tether_core::{CancelToken, ScheduleResult, TaskError, WorkItem, WorkQueue};

/// Single-thread context pumped by whichever thread calls `run`
pub struct PumpContext {
    name: String,
    queue: WorkQueue,
}

impl PumpContext {
    /// Create a context; nothing runs until `run` is called
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            queue: WorkQueue::new(),
        })
    }

    /// Run `action` on the calling thread, then pump posted work until completed
    ///
    /// The context is current for the whole call. Panics from the action or
    /// from pumped callbacks are logged and swallowed. Returns the number of
    /// posted callbacks that ran.
    pub fn run<F>(self: &Arc<Self>, action: F) -> usize
    where
        F: FnOnce(&ContextRef),
    {
        let ctx: ContextRef = self.clone();
        let _guard = context::enter(ctx.clone());

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| action(&ctx))) {
            let error = TaskError::from_panic(payload.as_ref());
            tracing::warn!(context = %self.name, %error, "pump entry action panicked");
        }

        let mut pumped = 0;
        while let Ok(Some(item)) = self.queue.dequeue(&CancelToken::none()) {
            self.execute(item);
            pumped += 1;
        }
        pumped
    }

    /// Stop the pump once already-posted work has run
    pub fn complete(&self) {
        self.queue.complete();
    }

    /// Number of posted callbacks waiting to run
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    fn execute(&self, item: WorkItem) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| item.run())) {
            let error = TaskError::from_panic(payload.as_ref());
            tracing::warn!(context = %self.name, %error, "pumped callback panicked");
        }
    }
}

impl DispatchContext for PumpContext {
    /// Runs on the calling thread; panics are logged, not propagated
    fn send(&self, item: WorkItem) -> ScheduleResult<()> {
        self.execute(item);
        Ok(())
    }

    fn post(&self, item: WorkItem) {
        self.queue.try_enqueue(item);
    }

    fn max_concurrency(&self) -> usize {
        1
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::thread;

    #[test]
    fn test_posts_run_on_pumping_thread_in_order() {
        let pump = PumpContext::new("ui");
        let closer = pump.clone();
        let log = Arc::new(Mutex::new(Vec::new()));

        let log_clone = log.clone();
        let pumped = pump.run(move |ctx| {
            for i in 0..3 {
                let log = log_clone.clone();
                ctx.post(WorkItem::from_fn(move || {
                    log.lock().push((i, thread::current().id()));
                }));
            }
            let current = context::current().expect("pump is current");
            current.post(WorkItem::from_fn(move || closer.complete()));
        });

        assert_eq!(pumped, 4);
        let entries = log.lock().clone();
        assert_eq!(entries.iter().map(|e| e.0).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(entries.iter().all(|e| e.1 == thread::current().id()));
    }

    #[test]
    fn test_foreign_thread_posts_and_completes() {
        let pump = PumpContext::new("loop");
        let remote = pump.clone();
        let counter = Arc::new(Mutex::new(0));
        let c = counter.clone();

        let pumped = pump.run(move |_| {
            thread::spawn(move || {
                for _ in 0..5 {
                    let c = c.clone();
                    remote.post(WorkItem::from_fn(move || *c.lock() += 1));
                }
                remote.complete();
            });
        });

        assert_eq!(pumped, 5);
        assert_eq!(*counter.lock(), 5);
        assert!(context::current().is_none());
    }

    #[test]
    fn test_panics_are_contained() {
        let pump = PumpContext::new("contained");
        let closer = pump.clone();
        let after = Arc::new(Mutex::new(false));
        let a = after.clone();

        let pumped = pump.run(move |ctx| {
            ctx.post(WorkItem::from_fn(|| panic!("posted failure")));
            ctx.post(WorkItem::from_fn(move || *a.lock() = true));
            ctx.send(WorkItem::from_fn(|| panic!("sent failure"))).unwrap();
            closer.complete();
            panic!("entry failure");
        });

        assert_eq!(pumped, 2);
        assert!(*after.lock());
    }

    #[test]
    fn test_post_after_complete_is_dropped() {
        let pump = PumpContext::new("finished");
        pump.complete();
        pump.post(WorkItem::from_fn(|| panic!("must not run")));
        assert_eq!(pump.pending(), 0);
        assert_eq!(pump.run(|_| {}), 0);
    }
}
