//! Dispatch contexts and the scoped current context
//!
//! A [`DispatchContext`] decides *where* a callback runs: `send` runs it
//! synchronously (possibly marshalled to another thread), `post` queues it
//! and returns at once.
//!
//! Each thread has a "current" context slot. Code that produces
//! continuations reads it to route them back to where they belong. The slot
//! is only ever changed through [`enter`], whose guard restores the previous
//! value on every exit path, including unwinding. Components that need a
//! context beyond one call stack take a [`ContextRef`] explicitly.

use crate::pool::WorkerPool;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::Arc;
use tether_core::{ScheduleResult, WorkItem};

/// Where callbacks run
pub trait DispatchContext: Send + Sync {
    /// Run `item` synchronously before returning
    ///
    /// Panics raised by the callback propagate to the caller unless the
    /// context documents otherwise.
    fn send(&self, item: WorkItem) -> ScheduleResult<()>;

    /// Queue `item` for asynchronous execution
    ///
    /// Best effort: work posted to a context that is shutting down is
    /// dropped without error.
    fn post(&self, item: WorkItem);

    /// Upper bound on callbacks this context runs at the same time
    fn max_concurrency(&self) -> usize;

    /// Human-readable name, used in logs
    fn name(&self) -> &str;
}

/// Shared handle to a dispatch context
pub type ContextRef = Arc<dyn DispatchContext>;

thread_local! {
    static CURRENT: RefCell<Option<ContextRef>> = const { RefCell::new(None) };
}

/// Get the calling thread's current context, if one is installed
pub fn current() -> Option<ContextRef> {
    CURRENT.with(|slot| slot.borrow().clone())
}

/// Install `ctx` as the calling thread's current context
///
/// The previous context comes back when the guard drops.
pub fn enter(ctx: ContextRef) -> ContextGuard {
    let previous = CURRENT.with(|slot| slot.borrow_mut().replace(ctx));
    ContextGuard {
        previous,
        _not_send: PhantomData,
    }
}

/// Restores the previous current context on drop
#[must_use = "the previous context is restored as soon as the guard drops"]
pub struct ContextGuard {
    previous: Option<ContextRef>,
    // The guard restores a thread-local, so it must stay on its thread
    _not_send: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        // The slot may already be gone during thread teardown
        let _ = CURRENT.try_with(|slot| *slot.borrow_mut() = previous);
    }
}

/// Run `action` through `ctx` with `ctx` installed as current
///
/// Performs exactly one `send` of the action. The previous context is
/// restored however the call ends.
pub fn run<F>(ctx: ContextRef, action: F) -> ScheduleResult<()>
where
    F: FnOnce(&ContextRef) + Send + 'static,
{
    let _guard = enter(ctx.clone());
    let target = ctx.clone();
    ctx.send(WorkItem::from_fn(move || action(&target)))
}

/// Post `item` to the current context, or to the shared pool if none is set
pub fn dispatch(item: WorkItem) {
    match current() {
        Some(ctx) => ctx.post(item),
        None => WorkerPool::shared().execute(move || item.run()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::panic::{self, AssertUnwindSafe};

    /// Context that runs everything inline and records what it saw
    struct Inline {
        name: String,
        log: Mutex<Vec<String>>,
    }

    impl Inline {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                log: Mutex::new(Vec::new()),
            })
        }
    }

    impl DispatchContext for Inline {
        fn send(&self, item: WorkItem) -> ScheduleResult<()> {
            self.log.lock().push("send".to_string());
            item.run();
            Ok(())
        }

        fn post(&self, item: WorkItem) {
            self.log.lock().push("post".to_string());
            item.run();
        }

        fn max_concurrency(&self) -> usize {
            1
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    fn current_name() -> Option<String> {
        current().map(|c| c.name().to_string())
    }

    #[test]
    fn test_enter_restores_previous() {
        assert!(current().is_none());
        {
            let _outer = enter(Inline::new("outer"));
            assert_eq!(current_name().as_deref(), Some("outer"));
            {
                let _inner = enter(Inline::new("inner"));
                assert_eq!(current_name().as_deref(), Some("inner"));
            }
            assert_eq!(current_name().as_deref(), Some("outer"));
        }
        assert!(current().is_none());
    }

    #[test]
    fn test_run_sends_once_with_context_installed() {
        let ctx = Inline::new("runner");
        let seen = Arc::new(Mutex::new(None));
        let seen_clone = seen.clone();

        run(ctx.clone(), move |explicit| {
            *seen_clone.lock() = Some((current_name(), explicit.name().to_string()));
        })
        .unwrap();

        assert_eq!(
            *seen.lock(),
            Some((Some("runner".to_string()), "runner".to_string()))
        );
        assert_eq!(*ctx.log.lock(), vec!["send".to_string()]);
        assert!(current().is_none());
    }

    #[test]
    fn test_run_restores_on_panic() {
        let _outer = enter(Inline::new("outer"));

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            run(Inline::new("failing"), |_| panic!("action failed"))
        }));

        assert!(result.is_err());
        assert_eq!(current_name().as_deref(), Some("outer"));
    }

    #[test]
    fn test_dispatch_prefers_current() {
        let ctx = Inline::new("target");
        let _guard = enter(ctx.clone());

        dispatch(WorkItem::from_fn(|| {}));
        assert_eq!(*ctx.log.lock(), vec!["post".to_string()]);
    }

    #[test]
    fn test_dispatch_falls_back_to_pool() {
        let (tx, rx) = crossbeam::channel::bounded(1);
        dispatch(WorkItem::from_fn(move || {
            tx.send(std::thread::current().name().map(str::to_string))
                .unwrap();
        }));

        let name = rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .unwrap()
            .unwrap_or_default();
        assert!(name.starts_with("tether-pool"));
    }
}
