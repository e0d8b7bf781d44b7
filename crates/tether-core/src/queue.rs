//! Blocking FIFO work queue
//!
//! Any number of producers enqueue; consumers block in [`WorkQueue::dequeue`]
//! until an item arrives, the queue is completed and drained, or their
//! cancellation token fires.

use crate::cancel::CancelToken;
use crate::error::{ScheduleError, ScheduleResult};
use crate::item::{PendingItem, WorkItem};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

struct QueueState {
    items: VecDeque<WorkItem>,
    completed: bool,
}

struct QueueInner {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl QueueInner {
    fn wake_all(&self) {
        // Taking the lock orders the wake-up after any in-progress check
        let _state = self.state.lock();
        self.available.notify_all();
    }
}

/// Thread-safe FIFO queue of pending work
///
/// Cloning the queue shares it.
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<QueueInner>,
}

impl WorkQueue {
    /// Create an empty, open queue
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    items: VecDeque::new(),
                    completed: false,
                }),
                available: Condvar::new(),
            }),
        }
    }

    /// Append an item
    ///
    /// Fails with [`ScheduleError::Closed`] once the queue has been completed.
    pub fn enqueue(&self, item: WorkItem) -> ScheduleResult<()> {
        let mut state = self.inner.state.lock();
        if state.completed {
            return Err(ScheduleError::Closed);
        }
        state.items.push_back(item);
        self.inner.available.notify_one();
        Ok(())
    }

    /// Append an item, silently dropping it if the queue is closed
    ///
    /// Returns whether the item was accepted.
    pub fn try_enqueue(&self, item: WorkItem) -> bool {
        match self.enqueue(item) {
            Ok(()) => true,
            Err(_) => {
                tracing::trace!("dropping work item enqueued after completion");
                false
            }
        }
    }

    /// Take the oldest item, blocking until one is available
    ///
    /// Returns `Ok(None)` once the queue is completed and empty, and
    /// `Err(ScheduleError::Cancelled)` as soon as `cancel` fires, even if
    /// items remain queued.
    pub fn dequeue(&self, cancel: &CancelToken) -> ScheduleResult<Option<WorkItem>> {
        let weak = Arc::downgrade(&self.inner);
        let _wake = cancel.register(move || {
            if let Some(inner) = weak.upgrade() {
                inner.wake_all();
            }
        });

        let mut state = self.inner.state.lock();
        loop {
            if cancel.is_cancelled() {
                return Err(ScheduleError::Cancelled);
            }
            if let Some(item) = state.items.pop_front() {
                return Ok(Some(item));
            }
            if state.completed {
                return Ok(None);
            }
            self.inner.available.wait(&mut state);
        }
    }

    /// Mark that no further items will be accepted
    ///
    /// Idempotent. Consumers drain what is already queued, then see `None`.
    pub fn complete(&self) {
        let mut state = self.inner.state.lock();
        if !state.completed {
            state.completed = true;
            self.inner.available.notify_all();
        }
    }

    /// Check whether the queue has been completed
    pub fn is_completed(&self) -> bool {
        self.inner.state.lock().completed
    }

    /// Get the number of queued items
    pub fn len(&self) -> usize {
        self.inner.state.lock().items.len()
    }

    /// Check whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Describe the queued items in FIFO order
    pub fn snapshot(&self) -> Vec<PendingItem> {
        self.inner
            .state
            .lock()
            .items
            .iter()
            .map(WorkItem::describe)
            .collect()
    }

    /// Complete the queue and drop every item still queued
    ///
    /// Returns how many items were abandoned.
    pub fn close_and_clear(&self) -> usize {
        let abandoned: Vec<WorkItem> = {
            let mut state = self.inner.state.lock();
            state.completed = true;
            self.inner.available.notify_all();
            state.items.drain(..).collect()
        };
        // Dropped outside the lock; captured values may have arbitrary Drop impls
        abandoned.len()
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("WorkQueue")
            .field("len", &state.items.len())
            .field("completed", &state.completed)
            .finish()
    }
}
