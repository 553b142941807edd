//! Messages exchanged between the pool and its workers.
//!
//! Thread workers pass these values in memory. Process workers serialize
//! them as newline-delimited JSON over the child's stdin/stdout.

use serde::{Deserialize, Serialize};

use crate::domain::{TaskDescriptor, TaskId, TaskType};

/// Coordinator -> worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    /// Run one task.
    Task {
        id: TaskId,
        task_type: TaskType,
        payload: serde_json::Value,
    },

    /// Best-effort cooperative stop of a running task.
    Cancel { id: TaskId },

    /// Graceful shutdown: the worker stops reading and exits once its
    /// running tasks have reported. Pools kill their workers on close
    /// instead; this is for other drivers of `serve`, such as a parent that
    /// wants to drain a child.
    Exit,
}

/// Worker -> coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerResponse {
    /// Startup handshake. A non-null `error` means the worker is unusable.
    Ready {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Intermediate progress; does not finish the task.
    Status {
        id: TaskId,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        completion_percentage: Option<f32>,
    },

    /// Handler succeeded.
    Result {
        id: TaskId,
        result: serde_json::Value,
    },

    /// Handler failed.
    Error { id: TaskId, error: String },

    /// Handler observed a cooperative cancel and stopped.
    Cancelled { id: TaskId },
}

impl WorkerRequest {
    pub fn task(descriptor: TaskDescriptor) -> Self {
        let (id, task_type, payload) = descriptor.into_parts();
        Self::Task {
            id,
            task_type,
            payload,
        }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

impl WorkerResponse {
    pub fn ready() -> Self {
        Self::Ready { error: None }
    }

    pub fn error(id: TaskId, error: impl Into<String>) -> Self {
        Self::Error {
            id,
            error: error.into(),
        }
    }

    /// Task this message belongs to (`None` for the handshake).
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Self::Ready { .. } => None,
            Self::Status { id, .. }
            | Self::Result { id, .. }
            | Self::Error { id, .. }
            | Self::Cancelled { id } => Some(*id),
        }
    }

    /// Does this message finish its task?
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Result { .. } | Self::Error { .. } | Self::Cancelled { .. }
        )
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}
