//! Runs one task against a registry, shared by thread and process workers.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use crate::domain::{TaskId, TaskType};
use crate::protocol::WorkerResponse;
use crate::typed::{CancelSignal, HandlerError, HandlerRegistry, Reporter, TaskContext};

/// Execute a task and turn its outcome into the terminal message.
///
/// `Err` carries the panic message: a panicking handler takes its worker
/// down with it, so the caller must report a fault instead of a result.
pub(crate) fn execute(
    registry: &HandlerRegistry,
    id: TaskId,
    task_type: &TaskType,
    payload: serde_json::Value,
    cancel: &CancelSignal,
    reporter: Reporter,
) -> Result<WorkerResponse, String> {
    let ctx = TaskContext::new(id, cancel.clone(), reporter);
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        registry.execute(task_type, payload, &ctx)
    }));
    let cancelled = ctx.is_cancelled();
    cancel.clear(id);

    match outcome {
        Ok(Ok(_)) | Ok(Err(HandlerError::Cancelled)) if cancelled => {
            Ok(WorkerResponse::Cancelled { id })
        }
        Ok(Ok(result)) => Ok(WorkerResponse::Result { id, result }),
        Ok(Err(HandlerError::Cancelled)) => Ok(WorkerResponse::Cancelled { id }),
        Ok(Err(e)) => Ok(WorkerResponse::error(id, e.to_string())),
        Err(payload) => Err(panic_message(payload.as_ref())),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
