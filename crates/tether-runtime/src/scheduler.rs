//! Scheduler abstraction shared by the affine executor and the bounded dispatcher

use tether_core::{PendingItem, WorkItem};

/// Something that accepts work items and runs each of them exactly once
pub trait Scheduler: Send + Sync {
    /// Queue `item` for later execution; dropped silently after shutdown
    fn schedule(&self, item: WorkItem);

    /// Run `item` synchronously on the calling thread if this scheduler allows it
    ///
    /// `Ok` means the item ran. `Err` hands the item back untouched: it was
    /// neither executed nor queued.
    fn try_execute_inline(&self, item: WorkItem) -> Result<(), WorkItem>;

    /// Describe the items accepted but not yet started, oldest first
    fn list_pending(&self) -> Vec<PendingItem>;

    /// Maximum number of items this scheduler runs at once
    fn max_concurrency(&self) -> usize;
}
