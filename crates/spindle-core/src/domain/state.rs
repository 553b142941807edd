//! Per-task state machine.

use serde::{Deserialize, Serialize};

/// Task state.
///
/// State transitions:
/// - Queued -> Processing -> Completed
/// - Queued -> Processing -> Errored
/// - Queued -> Processing -> Cancelled (in-flight cancel)
/// - Queued -> Cancelled (pending cancel, no worker touched)
///
/// Terminal states never transition again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting in the pool queue.
    Queued,

    /// Sent to a worker.
    Processing,

    /// Worker returned a result.
    Completed,

    /// Handler error or worker fault.
    Errored,

    /// Cancelled before or during execution.
    Cancelled,
}

impl TaskState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Errored | TaskState::Cancelled
        )
    }

    pub fn can_transition_to(self, next: TaskState) -> bool {
        match (self, next) {
            (TaskState::Queued, TaskState::Processing) => true,
            (TaskState::Queued, TaskState::Cancelled) => true,
            (TaskState::Processing, n) => n.is_terminal(),
            _ => false,
        }
    }
}
