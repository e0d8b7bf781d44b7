//! Unique identifiers for work items and tracked tasks

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a queued WorkItem
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkItemId(u64);

static NEXT_ITEM_ID: AtomicU64 = AtomicU64::new(1);

impl WorkItemId {
    /// Generate a new unique WorkItemId
    pub fn new() -> Self {
        WorkItemId(NEXT_ITEM_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for WorkItemId {
    fn default() -> Self {
        Self::new()
    }
}

/// Unique identifier for a unit of asynchronous work
///
/// Ids are never reused within a process, so a registry keyed by `TaskId`
/// can never confuse a finished task with a newer one.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    /// Generate a new unique TaskId
    pub fn new() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
