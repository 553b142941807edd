//! Progress events emitted to an external observer (usually a UI).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TaskId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressKind {
    Queued,
    Processing,
    Cancelling,
    Status {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        completion_percentage: Option<f32>,
    },
}

/// One notification, addressed by task id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub task_id: TaskId,
    #[serde(flatten)]
    pub kind: ProgressKind,
    pub at: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(task_id: TaskId, kind: ProgressKind, at: DateTime<Utc>) -> Self {
        Self { task_id, kind, at }
    }
}
