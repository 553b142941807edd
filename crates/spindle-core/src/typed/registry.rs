//! HandlerRegistry - task_type -> handler table living inside a worker.
//!
//! Built during initialization (mutable), then shared read-only behind an
//! `Arc` by the worker thread or process that executes tasks.

use std::collections::HashMap;
use std::sync::Arc;

use super::context::TaskContext;
use super::handler::{DynHandler, Handler, HandlerError, TypedHandler};
use super::task::Task;
use crate::domain::{Capabilities, TaskType};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Handler for task type '{0}' is already registered")]
    AlreadyRegistered(TaskType),
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn DynHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register<T: Task, H: Handler<T> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), RegistryError> {
        self.register_dyn(Arc::new(TypedHandler::<T, H>::new(handler)))
    }

    /// Register an already type-erased handler.
    pub fn register_dyn(&mut self, handler: Arc<dyn DynHandler>) -> Result<(), RegistryError> {
        let task_type = TaskType::new(handler.task_type());
        if self.handlers.contains_key(&task_type) {
            return Err(RegistryError::AlreadyRegistered(task_type));
        }
        self.handlers.insert(task_type, handler);
        Ok(())
    }

    /// Builder-style `register`.
    pub fn with<T: Task, H: Handler<T> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.register::<T, H>(handler)?;
        Ok(self)
    }

    pub fn get(&self, task_type: &TaskType) -> Option<Arc<dyn DynHandler>> {
        self.handlers.get(task_type).cloned()
    }

    /// Registered task types, sorted.
    pub fn registered_types(&self) -> Vec<TaskType> {
        let mut types: Vec<TaskType> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    /// What a worker backed by this registry can run.
    pub fn capabilities(&self) -> Capabilities {
        self.handlers.keys().cloned().collect()
    }

    /// Run every handler's `init`, stopping at the first failure.
    pub fn init_all(&self) -> Result<(), HandlerError> {
        for task_type in self.registered_types() {
            if let Some(handler) = self.handlers.get(&task_type) {
                handler.init()?;
            }
        }
        Ok(())
    }

    pub fn execute(
        &self,
        task_type: &TaskType,
        payload: serde_json::Value,
        ctx: &TaskContext,
    ) -> Result<serde_json::Value, HandlerError> {
        let handler = self
            .handlers
            .get(task_type)
            .ok_or_else(|| HandlerError::NotFound(task_type.clone()))?;
        handler.handle_dyn(payload, ctx)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
