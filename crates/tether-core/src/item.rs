//! Units of work accepted by queues, executors and dispatch contexts

use crate::id::WorkItemId;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Opaque state handed to a callback when it runs
pub type State = Option<Arc<dyn Any + Send + Sync>>;

type Callback = Box<dyn FnOnce(State) + Send + 'static>;

/// A callback plus the state it will be invoked with
///
/// A WorkItem is immutable once built. Whoever holds it owns it; running it
/// consumes it, so a callback executes at most once.
pub struct WorkItem {
    id: WorkItemId,
    label: Option<String>,
    callback: Callback,
    state: State,
}

impl WorkItem {
    /// Create a work item from a callback and the state it receives
    pub fn new<F>(callback: F, state: State) -> Self
    where
        F: FnOnce(State) + Send + 'static,
    {
        Self {
            id: WorkItemId::new(),
            label: None,
            callback: Box::new(callback),
            state,
        }
    }

    /// Create a stateless work item from a plain closure
    pub fn from_fn<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::new(move |_| f(), None)
    }

    /// Attach a human-readable label, reported by pending-work listings
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Get the item's unique id
    pub fn id(&self) -> WorkItemId {
        self.id
    }

    /// Get the item's label, if any
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Invoke the callback with its state, consuming the item
    pub fn run(self) {
        (self.callback)(self.state)
    }

    /// Describe the item without exposing its callback
    pub fn describe(&self) -> PendingItem {
        PendingItem {
            id: self.id,
            label: self.label.clone(),
        }
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("has_state", &self.state.is_some())
            .finish()
    }
}

/// Description of a queued item that has not run yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingItem {
    /// Id of the queued item
    pub id: WorkItemId,
    /// Label of the queued item
    pub label: Option<String>,
}
