//! Tether Runtime
//!
//! Execution contexts built on `tether-core`:
//! - [`AffineExecutor`]: every callback on one dedicated thread, in order
//! - [`PumpContext`]: a queue pumped by the thread that runs it
//! - [`BoundedDispatcher`]: at most N callbacks at once on the shared pool
//! - [`TaskRegistry`]: background tasks tied to an application [`Lifetime`],
//!   drained with a deadline at shutdown
//!
//! The per-thread current context lives in [`context`].

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod context;
pub mod dispatcher;
pub mod executor;
pub mod lifetime;
pub mod pool;
pub mod pump;
pub mod registry;
pub mod scheduler;
pub mod task;

pub use context::{ContextGuard, ContextRef, DispatchContext};
pub use dispatcher::BoundedDispatcher;
pub use executor::{AffineExecutor, ExecutorOptions, ExecutorState};
pub use lifetime::{AppLifetime, Lifetime};
pub use pool::{PoolConfig, WorkerPool, POOL_THREADS_ENV};
pub use pump::PumpContext;
pub use registry::{DrainReport, FaultHook, LogFaultHook, TaskLabel, TaskRegistry};
pub use scheduler::Scheduler;
pub use task::{spawn, spawn_on, Outcome, TaskCompleter, TaskHandle, TaskStatus};

pub use tether_core::{
    CancelSource, CancelToken, LinkedSource, PendingItem, ScheduleError, ScheduleResult,
    TaskError, TaskId, WorkItem,
};
