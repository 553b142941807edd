//! TaskContext - what a handler sees besides its payload.
//!
//! Handlers get their task id, a reporter that sends `Status` messages back
//! to the pool, and a view of the worker's [`CancelSignal`]. Cancellation is
//! cooperative: nothing interrupts a handler, it polls
//! [`TaskContext::is_cancelled`] between chunks of work and returns
//! `HandlerError::Cancelled`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::domain::TaskId;
use crate::protocol::WorkerResponse;

/// Cooperative cancel flags shared between a worker's control side and the
/// code running its tasks.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    cancelled: Arc<Mutex<HashSet<TaskId>>>,
}

impl CancelSignal {
    pub fn cancel(&self, id: TaskId) {
        self.ids().insert(id);
    }

    pub fn is_cancelled(&self, id: TaskId) -> bool {
        self.ids().contains(&id)
    }

    pub fn clear(&self, id: TaskId) {
        self.ids().remove(&id);
    }

    /// Drop every flag except the one for `id`. Workers that run one task at
    /// a time call this as `id` starts, so a cancel that raced past the end
    /// of the previous task does not linger.
    pub fn retain_only(&self, id: TaskId) {
        self.ids().retain(|flagged| *flagged == id);
    }

    fn ids(&self) -> std::sync::MutexGuard<'_, HashSet<TaskId>> {
        // a panicking handler must not wedge cancellation for the next task
        self.cancelled.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Sends a message back towards the pool.
pub type Reporter = Arc<dyn Fn(WorkerResponse) + Send + Sync>;

pub struct TaskContext {
    id: TaskId,
    cancel: CancelSignal,
    reporter: Reporter,
}

impl TaskContext {
    pub fn new(id: TaskId, cancel: CancelSignal, reporter: Reporter) -> Self {
        Self {
            id,
            cancel,
            reporter,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.id
    }

    /// Long-running handlers should poll this between chunks of work.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled(self.id)
    }

    /// Emit an intermediate status update.
    pub fn report(&self, message: impl Into<String>, completion_percentage: Option<f32>) {
        (self.reporter)(WorkerResponse::Status {
            id: self.id,
            message: message.into(),
            completion_percentage,
        });
    }
}
