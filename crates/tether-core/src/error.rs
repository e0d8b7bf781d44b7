//! Error taxonomy shared by every Tether component

use std::io;

/// Errors raised by queues, executors and dispatchers
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    /// The queue or executor no longer accepts work
    #[error("Work queue is closed")]
    Closed,

    /// A lifecycle method was called on an executor that is already shut down
    #[error("Executor '{0}' has already been disposed")]
    AlreadyDisposed(String),

    /// A cancellation signal fired while waiting
    #[error("Operation was cancelled")]
    Cancelled,

    /// The call would make the executor's own thread wait for itself
    #[error("Cannot wait for executor '{0}' from its own thread")]
    OwnerThread(String),

    /// A concurrency bound of zero can never admit work
    #[error("Invalid concurrency level: {0}")]
    InvalidConcurrency(usize),

    /// The operating system refused to start a thread
    #[error("Failed to spawn thread: {0}")]
    Spawn(#[from] io::Error),
}

/// Result alias for scheduling operations
pub type ScheduleResult<T> = Result<T, ScheduleError>;

/// How a unit of asynchronous work ended when it did not produce a value
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// The work observed cancellation before producing a result
    #[error("Task was cancelled")]
    Cancelled,

    /// The work panicked or reported a failure
    #[error("Task faulted: {0}")]
    Faulted(String),

    /// The producer went away without ever completing the task
    #[error("Task was abandoned before completion")]
    Abandoned,
}

impl TaskError {
    /// Build a fault from a panic payload captured by `catch_unwind`
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        TaskError::Faulted(message)
    }

    /// Whether this error represents cancellation rather than failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled)
    }
}
