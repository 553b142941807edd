//! ProgressSink port - where queued/processing/cancelling/status
//! notifications go.
//!
//! A sink is attached per task at submission time. The pool calls it from its
//! own task, so implementations must not block.

use tokio::sync::mpsc;

use crate::domain::{ProgressEvent, ProgressKind};

pub trait ProgressSink: Send + Sync {
    fn notify(&self, event: ProgressEvent);
}

/// Forwards events into an unbounded channel (e.g. towards a UI bridge).
#[derive(Debug, Clone)]
pub struct ChannelProgressSink {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelProgressSink {
    pub fn new(tx: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        Self { tx }
    }

    /// Sink plus the receiving end.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

impl ProgressSink for ChannelProgressSink {
    fn notify(&self, event: ProgressEvent) {
        // receiver gone means nobody is watching anymore
        let _ = self.tx.send(event);
    }
}

/// Writes every event to the `tracing` log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn notify(&self, event: ProgressEvent) {
        match &event.kind {
            ProgressKind::Status {
                message,
                completion_percentage,
            } => tracing::info!(
                task_id = %event.task_id,
                percentage = ?completion_percentage,
                "{message}"
            ),
            kind => tracing::debug!(task_id = %event.task_id, ?kind, "task progress"),
        }
    }
}
