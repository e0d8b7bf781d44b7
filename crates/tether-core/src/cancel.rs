//! Broadcast cancellation
//!
//! A [`CancelSource`] owns the right to fire a signal; any number of
//! [`CancelToken`]s observe it. Observers either poll, block with a
//! deadline, or register callbacks. Every registration is a
//! [`Registration`] guard: dropping it unregisters the callback, whether or
//! not the signal ever fired.
//!
//! A [`LinkedSource`] composes several tokens into one signal that fires
//! when any input fires. The link holds registrations on every input, so it
//! must be disposed (dropped) once the composed signal is no longer needed.

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Registered callbacks, keyed so registrations can remove their own entry
#[derive(Default)]
struct CallbackTable {
    next_key: u64,
    callbacks: FxHashMap<u64, Callback>,
}

struct CancelState {
    /// Fast-path flag; only ever goes from false to true
    cancelled: AtomicBool,

    /// Callbacks waiting for the signal
    table: Mutex<CallbackTable>,

    /// Wakes threads blocked in `wait_timeout`
    notify: Condvar,
}

impl CancelState {
    fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            table: Mutex::new(CallbackTable::default()),
            notify: Condvar::new(),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }

        let callbacks: Vec<Callback> = {
            let mut table = self.table.lock();
            self.notify.notify_all();
            table.callbacks.drain().map(|(_, cb)| cb).collect()
        };

        // Callbacks run outside the lock so they may register or cancel freely
        for callback in callbacks {
            if panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
                tracing::warn!("cancellation callback panicked");
            }
        }
    }
}

/// The owning side of a cancellation signal
#[derive(Clone)]
pub struct CancelSource {
    state: Arc<CancelState>,
}

impl CancelSource {
    /// Create a new, not yet cancelled source
    pub fn new() -> Self {
        Self {
            state: Arc::new(CancelState::new()),
        }
    }

    /// Get a token observing this source
    pub fn token(&self) -> CancelToken {
        CancelToken {
            state: Some(self.state.clone()),
        }
    }

    /// Fire the signal. Idempotent; callbacks run once, on the calling thread.
    pub fn cancel(&self) {
        self.state.cancel();
    }

    /// Check whether the signal has fired
    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelSource")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// The observing side of a cancellation signal
///
/// `CancelToken::none()` (also the `Default`) observes nothing and never fires.
#[derive(Clone, Default)]
pub struct CancelToken {
    state: Option<Arc<CancelState>>,
}

impl CancelToken {
    /// A token that can never be cancelled
    pub fn none() -> Self {
        Self { state: None }
    }

    /// Whether this is the never-cancelled token
    pub fn is_none(&self) -> bool {
        self.state.is_none()
    }

    /// Check whether the observed signal has fired
    pub fn is_cancelled(&self) -> bool {
        self.state.as_ref().is_some_and(|s| s.is_cancelled())
    }

    /// Whether two tokens observe the same signal
    pub fn same_as(&self, other: &CancelToken) -> bool {
        match (&self.state, &other.state) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Register a callback to run when the signal fires
    ///
    /// If the signal already fired, the callback runs immediately on the
    /// calling thread and the returned registration is inert. On the
    /// never-cancelled token the callback is dropped without running.
    pub fn register<F>(&self, callback: F) -> Registration
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(state) = &self.state else {
            return Registration::inert();
        };

        {
            let mut table = state.table.lock();
            if !state.is_cancelled() {
                let key = table.next_key;
                table.next_key += 1;
                table.callbacks.insert(key, Box::new(callback));
                return Registration {
                    state: Arc::downgrade(state),
                    key: Some(key),
                };
            }
        }

        callback();
        Registration::inert()
    }

    /// Block until the signal fires or `timeout` elapses
    ///
    /// Returns true if the signal fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let Some(state) = &self.state else {
            std::thread::sleep(timeout);
            return false;
        };

        let deadline = Instant::now() + timeout;
        let mut table = state.table.lock();
        while !state.is_cancelled() {
            if state.notify.wait_until(&mut table, deadline).timed_out() {
                break;
            }
        }
        state.is_cancelled()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("none", &self.is_none())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Guard for a registered cancellation callback
///
/// Dropping the guard (or calling [`Registration::release`]) unregisters the
/// callback. Releasing after the signal fired is a no-op.
#[must_use = "dropping a Registration unregisters its callback"]
pub struct Registration {
    state: Weak<CancelState>,
    key: Option<u64>,
}

impl Registration {
    fn inert() -> Self {
        Self {
            state: Weak::new(),
            key: None,
        }
    }

    /// Whether the callback is still waiting for the signal
    pub fn is_armed(&self) -> bool {
        let (Some(key), Some(state)) = (self.key, self.state.upgrade()) else {
            return false;
        };
        let armed = state.table.lock().callbacks.contains_key(&key);
        armed
    }

    /// Unregister the callback now
    pub fn release(mut self) {
        self.unregister();
    }

    fn unregister(&mut self) {
        if let (Some(key), Some(state)) = (self.key.take(), self.state.upgrade()) {
            // Removed outside the lock so a captured value's Drop cannot deadlock
            let removed = state.table.lock().callbacks.remove(&key);
            drop(removed);
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.unregister();
    }
}

/// A signal composed from several tokens, firing when any of them fires
///
/// The composed signal can also be cancelled directly. Dropping the link (or
/// calling [`LinkedSource::dispose`]) releases the registrations it holds on
/// its inputs; the composed token keeps whatever state it reached.
pub struct LinkedSource {
    source: CancelSource,
    links: Vec<Registration>,
}

impl LinkedSource {
    /// Link the given tokens into a new composed source
    pub fn new(inputs: &[&CancelToken]) -> Self {
        let source = CancelSource::new();
        let links = inputs
            .iter()
            .map(|input| {
                let target = source.clone();
                input.register(move || target.cancel())
            })
            .collect();
        Self { source, links }
    }

    /// Get a token observing the composed signal
    pub fn token(&self) -> CancelToken {
        self.source.token()
    }

    /// Get the composed source itself
    pub fn source(&self) -> &CancelSource {
        &self.source
    }

    /// Fire the composed signal directly
    pub fn cancel(&self) {
        self.source.cancel();
    }

    /// Check whether the composed signal has fired
    pub fn is_cancelled(&self) -> bool {
        self.source.is_cancelled()
    }

    /// Release the links to every input
    pub fn dispose(self) {
        drop(self);
    }
}

impl fmt::Debug for LinkedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkedSource")
            .field("cancelled", &self.is_cancelled())
            .field("links", &self.links.len())
            .finish()
    }
}
