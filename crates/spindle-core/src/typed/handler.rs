//! Handler trait - worker-side execution of a typed task.
//!
//! Two layers:
//! - `Handler<T>`: typed, what applications implement
//! - `DynHandler`: object-safe, JSON in / JSON out, what the registry stores
//!
//! `TypedHandler<T, H>` bridges the two (type erasure).

use std::marker::PhantomData;

use thiserror::Error;

use super::context::TaskContext;
use super::task::Task;
use crate::domain::TaskType;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    /// Handler stopped because `TaskContext::is_cancelled` turned true.
    #[error("task was cancelled")]
    Cancelled,

    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("handler not found for task_type={0}")]
    NotFound(TaskType),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Runs one task type. Handlers are CPU-bound and synchronous: they run on a
/// worker thread or inside a worker process, never on the async runtime.
pub trait Handler<T: Task>: Send + Sync {
    fn handle(&self, task: T, ctx: &TaskContext) -> Result<T::Output, HandlerError>;

    /// Called once inside the worker before it reports ready.
    fn init(&self) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// Object-safe handler.
pub trait DynHandler: Send + Sync {
    fn handle_dyn(
        &self,
        payload: serde_json::Value,
        ctx: &TaskContext,
    ) -> Result<serde_json::Value, HandlerError>;

    fn init(&self) -> Result<(), HandlerError>;

    fn task_type(&self) -> &str;
}

pub struct TypedHandler<T: Task, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn(T)>,
}

impl<T: Task, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

impl<T: Task, H: Handler<T>> DynHandler for TypedHandler<T, H> {
    fn handle_dyn(
        &self,
        payload: serde_json::Value,
        ctx: &TaskContext,
    ) -> Result<serde_json::Value, HandlerError> {
        let task: T = serde_json::from_value(payload)?;
        let output = self.handler.handle(task, ctx)?;
        Ok(serde_json::to_value(output)?)
    }

    fn init(&self) -> Result<(), HandlerError> {
        self.handler.init()
    }

    fn task_type(&self) -> &str {
        T::TYPE
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::domain::TaskId;
    use crate::typed::context::CancelSignal;
    use crate::typed::task::fixtures::{Shout, Square};
    use serde_json::json;
    use std::sync::Arc;

    fn ctx() -> TaskContext {
        TaskContext::new(TaskId::generate(), CancelSignal::default(), Arc::new(|_| {}))
    }

    #[test]
    fn typed_handler_round_trips_json() {
        let handler = TypedHandler::<Square, _>::new(SquareHandler);
        let out = handler.handle_dyn(json!({ "value": 12 }), &ctx()).unwrap();
        assert_eq!(out, json!(144));
        assert_eq!(handler.task_type(), Square::TYPE);
    }

    #[test]
    fn bad_payload_is_a_payload_error() {
        let handler = TypedHandler::<Square, _>::new(SquareHandler);
        let err = handler.handle_dyn(json!({ "nope": 1 }), &ctx()).unwrap_err();
        assert!(matches!(err, HandlerError::Payload(_)));
    }

    #[test]
    fn handler_errors_pass_through() {
        let handler = TypedHandler::<Shout, _>::new(ShoutHandler);
        let err = handler.handle_dyn(json!({ "text": "" }), &ctx()).unwrap_err();
        assert_eq!(err.to_string(), "nothing to shout");
    }
}
