//! FIFO-fair counting admission gate
//!
//! The gate hands out at most `max_permits` [`Permit`]s at a time. Callers
//! either block for a permit or park a continuation that receives the permit
//! once one frees up. Released permits are handed directly to the oldest
//! waiter, so waiters are admitted in arrival order and a late arrival can
//! never overtake a queued one.

use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

type Continuation = Box<dyn FnOnce(Permit) + Send + 'static>;

thread_local! {
    /// Deferred hand-offs raised while this thread is already running one
    static HAND_OFFS: RefCell<Option<VecDeque<(Continuation, Permit)>>> = const { RefCell::new(None) };
}

/// A party waiting for a permit
enum Waiter {
    /// A thread blocked in `acquire`
    Thread(Arc<HandOff>),
    /// A continuation parked by `acquire_then`
    Deferred(Continuation),
}

/// One-shot slot a blocked thread waits on
#[derive(Default)]
struct HandOff {
    granted: Mutex<bool>,
    notify: Condvar,
}

impl HandOff {
    fn grant(&self) {
        *self.granted.lock() = true;
        self.notify.notify_one();
    }

    fn wait(&self) {
        let mut granted = self.granted.lock();
        while !*granted {
            self.notify.wait(&mut granted);
        }
    }
}

struct GateState {
    /// Permits not currently held by anyone
    available: usize,
    /// FIFO wait queue
    waiters: VecDeque<Waiter>,
}

struct GateInner {
    max_permits: usize,
    state: Mutex<GateState>,
}

impl GateInner {
    /// Return a permit: hand it to the oldest waiter, or put it back
    fn release(self: &Arc<Self>) {
        let next = {
            let mut state = self.state.lock();
            match state.waiters.pop_front() {
                Some(waiter) => waiter,
                None => {
                    debug_assert!(state.available < self.max_permits);
                    state.available += 1;
                    return;
                }
            }
        };

        match next {
            Waiter::Thread(hand_off) => hand_off.grant(),
            Waiter::Deferred(continuation) => run_deferred(continuation, Permit::new(self.clone())),
        }
    }
}

/// Run a deferred continuation, flattening chains of hand-offs into a loop
///
/// A continuation that drops its permit hands off to the next waiter. When
/// that happens on a thread already running a hand-off, the new one is
/// queued and run by the outer loop after the current one returns.
fn run_deferred(continuation: Continuation, permit: Permit) {
    let mut entry = Some((continuation, permit));
    let nested = HAND_OFFS
        .try_with(|slot| {
            let mut slot = slot.borrow_mut();
            match slot.as_mut() {
                Some(queue) => {
                    queue.extend(entry.take());
                    true
                }
                None => {
                    *slot = Some(VecDeque::new());
                    false
                }
            }
        })
        .unwrap_or(false);
    if nested {
        return;
    }

    let _reset = HandOffReset;
    while let Some((continuation, permit)) = entry.take() {
        continuation(permit);
        entry = HAND_OFFS
            .try_with(|slot| slot.borrow_mut().as_mut().and_then(VecDeque::pop_front))
            .ok()
            .flatten();
    }
}

/// Clears the hand-off queue when the outermost loop exits
struct HandOffReset;

impl Drop for HandOffReset {
    fn drop(&mut self) {
        // Non-empty only if a continuation unwound; leftover permits release normally
        let leftovers = HAND_OFFS.try_with(|slot| slot.borrow_mut().take()).ok().flatten();
        drop(leftovers);
    }
}

/// Counting gate bounding how many units of work hold a permit at once
///
/// Cloning the gate shares the same permits.
#[derive(Clone)]
pub struct AdmissionGate {
    inner: Arc<GateInner>,
}

impl AdmissionGate {
    /// Create a gate admitting up to `max_permits` holders
    pub fn new(max_permits: usize) -> Self {
        Self {
            inner: Arc::new(GateInner {
                max_permits,
                state: Mutex::new(GateState {
                    available: max_permits,
                    waiters: VecDeque::new(),
                }),
            }),
        }
    }

    /// Get the maximum number of simultaneous holders
    pub fn max_permits(&self) -> usize {
        self.inner.max_permits
    }

    /// Get the number of permits nobody holds
    pub fn available_permits(&self) -> usize {
        self.inner.state.lock().available
    }

    /// Get the number of permits currently held
    pub fn outstanding(&self) -> usize {
        self.inner.max_permits - self.available_permits()
    }

    /// Get the number of queued waiters
    pub fn waiting_count(&self) -> usize {
        self.inner.state.lock().waiters.len()
    }

    /// Take a permit if one is free and nobody is queued ahead
    pub fn try_acquire(&self) -> Option<Permit> {
        let mut state = self.inner.state.lock();
        if state.available > 0 && state.waiters.is_empty() {
            state.available -= 1;
            Some(Permit::new(self.inner.clone()))
        } else {
            None
        }
    }

    /// Block the calling thread until a permit is granted
    pub fn acquire(&self) -> Permit {
        let hand_off = {
            let mut state = self.inner.state.lock();
            if state.available > 0 && state.waiters.is_empty() {
                state.available -= 1;
                return Permit::new(self.inner.clone());
            }
            let hand_off = Arc::new(HandOff::default());
            state.waiters.push_back(Waiter::Thread(hand_off.clone()));
            hand_off
        };

        // The releasing side transferred its permit to us without touching `available`
        hand_off.wait();
        Permit::new(self.inner.clone())
    }

    /// Run `continuation` with a permit as soon as one is granted
    ///
    /// If a permit is free the continuation runs immediately on the calling
    /// thread; otherwise it is queued and later runs on the thread that
    /// releases the permit it receives. A release made from inside a
    /// continuation admits the next waiter only after that continuation
    /// returns. Continuations should only hand the permit off (for example
    /// to a pool), not do long work.
    pub fn acquire_then<F>(&self, continuation: F)
    where
        F: FnOnce(Permit) + Send + 'static,
    {
        {
            let mut state = self.inner.state.lock();
            if !(state.available > 0 && state.waiters.is_empty()) {
                state.waiters.push_back(Waiter::Deferred(Box::new(continuation)));
                return;
            }
            state.available -= 1;
        }
        continuation(Permit::new(self.inner.clone()));
    }
}

impl fmt::Debug for AdmissionGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("AdmissionGate")
            .field("max_permits", &self.inner.max_permits)
            .field("available", &state.available)
            .field("waiting", &state.waiters.len())
            .finish()
    }
}

/// A held admission permit, returned to its gate on drop
///
/// Release happens exactly once, including when the holder unwinds.
#[must_use = "dropping a Permit releases it immediately"]
pub struct Permit {
    gate: Arc<GateInner>,
}

impl Permit {
    fn new(gate: Arc<GateInner>) -> Self {
        Self { gate }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.gate.release();
    }
}

impl fmt::Debug for Permit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Permit")
            .field("max_permits", &self.gate.max_permits)
            .finish()
    }
}
