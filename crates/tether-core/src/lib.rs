//! Tether Core Primitives
//!
//! This crate provides the leaf building blocks of the Tether runtime:
//! - Work items and the blocking FIFO work queue
//! - Broadcast cancellation (sources, tokens, releasable registrations, links)
//! - The FIFO-fair admission gate used to bound concurrency
//! - The shared error taxonomy

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod cancel;
pub mod error;
pub mod gate;
pub mod id;
pub mod item;
pub mod queue;

pub use cancel::{CancelSource, CancelToken, LinkedSource, Registration};
pub use error::{ScheduleError, ScheduleResult, TaskError};
pub use gate::{AdmissionGate, Permit};
pub use id::{TaskId, WorkItemId};
pub use item::{PendingItem, State, WorkItem};
pub use queue::WorkQueue;
