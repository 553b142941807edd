//! Errors - pool and per-task error types.
//!
//! Two layers:
//! - `PoolError`: the pool or a worker adapter could not do its job
//!   (spawn, handshake, I/O, protocol). Only startup surfaces these to callers.
//! - `TaskError`: the outcome of one task, delivered through its callback.

use thiserror::Error;

use super::{TaskType, WorkerId};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to spawn worker for slot {slot}: {reason}")]
    Spawn { slot: usize, reason: String },

    #[error("worker for slot {slot} failed its ready handshake: {reason}")]
    Handshake { slot: usize, reason: String },

    #[error("worker initialization failed: {0}")]
    Init(String),

    #[error("task handler panicked: {0}")]
    HandlerPanicked(String),

    #[error("worker {0} is no longer reachable")]
    Disconnected(WorkerId),

    #[error("worker protocol error: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Outcome error for one task.
///
/// `Cancelled` is an expected outcome rather than a failure; check it with
/// [`TaskError::is_cancelled`] before reporting.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("task was cancelled")]
    Cancelled,

    /// The handler returned an error; the worker stays in service.
    #[error("task failed: {0}")]
    Failed(String),

    /// The worker running the task errored or exited.
    #[error("worker fault: {0}")]
    WorkerFault(String),

    #[error("no worker in this pool can run task_type={0}")]
    Unsupported(TaskType),

    #[error("pool is closed")]
    PoolClosed,

    #[error("failed to encode task payload: {0}")]
    Encode(String),

    #[error("failed to decode task result: {0}")]
    Decode(String),
}

impl TaskError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled)
    }
}

/// Result delivered to a task callback.
pub type TaskOutcome = Result<serde_json::Value, TaskError>;
