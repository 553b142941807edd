//! TaskInfo - the pool's bookkeeping for one submitted task.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::domain::{
    ProgressEvent, ProgressKind, TaskDescriptor, TaskError, TaskId, TaskOutcome, TaskState,
    TaskType,
};
use crate::ports::{Clock, ProgressSink};
use crate::protocol::WorkerRequest;

/// Receives the task's outcome. Runs on the pool task: keep it short.
pub type TaskCallback = Box<dyn FnOnce(TaskOutcome) + Send>;

/// Runs when the task is cancelled, before the callback.
pub type CancelCallback = Box<dyn FnOnce() + Send>;

/// Descriptor plus callbacks plus state.
///
/// The callback is stored as an `Option` and taken on first use, so it can
/// fire at most once whichever terminal path gets there first.
pub struct TaskInfo {
    task: TaskDescriptor,
    callback: Option<TaskCallback>,
    cancel_callback: Option<CancelCallback>,
    cancelled: bool,
    state: TaskState,
    progress: Option<Arc<dyn ProgressSink>>,
    clock: Arc<dyn Clock>,
}

impl TaskInfo {
    pub fn new(
        task: TaskDescriptor,
        callback: TaskCallback,
        cancel_callback: Option<CancelCallback>,
        progress: Option<Arc<dyn ProgressSink>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            task,
            callback: Some(callback),
            cancel_callback,
            cancelled: false,
            state: TaskState::Queued,
            progress,
            clock,
        }
    }

    pub fn id(&self) -> TaskId {
        self.task.id()
    }

    pub fn task_type(&self) -> &TaskType {
        self.task.task_type()
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub(crate) fn request(&self) -> WorkerRequest {
        WorkerRequest::task(self.task.clone())
    }

    pub(crate) fn notify(&self, kind: ProgressKind) {
        if let Some(sink) = &self.progress {
            sink.notify(ProgressEvent::new(self.id(), kind, self.clock.now()));
        }
    }

    pub(crate) fn mark_processing(&mut self) {
        if self.transition(TaskState::Processing) {
            self.notify(ProgressKind::Processing);
        }
    }

    /// Deliver the worker's verdict. Ignored once the task was cancelled.
    pub(crate) fn complete(&mut self, outcome: TaskOutcome) -> bool {
        if self.cancelled {
            return false;
        }
        let next = match &outcome {
            Ok(_) => TaskState::Completed,
            Err(TaskError::Cancelled) => TaskState::Cancelled,
            Err(_) => TaskState::Errored,
        };
        if !self.transition(next) {
            return false;
        }
        self.fire(outcome)
    }

    /// Mark cancelled, run the cancel callback, then report `Cancelled`.
    pub(crate) fn cancel(&mut self) -> bool {
        if self.cancelled || !self.transition(TaskState::Cancelled) {
            return false;
        }
        self.cancelled = true;
        if let Some(on_cancel) = self.cancel_callback.take() {
            on_cancel();
        }
        self.fire(Err(TaskError::Cancelled))
    }

    /// Refuse a task that never entered the queue.
    pub(crate) fn reject(mut self, error: TaskError) {
        debug!(task_id = %self.id(), task_type = %self.task_type(), %error, "task rejected");
        self.fire(Err(error));
    }

    fn transition(&mut self, next: TaskState) -> bool {
        if !self.state.can_transition_to(next) {
            debug!(task_id = %self.id(), from = ?self.state, to = ?next, "ignoring state change");
            return false;
        }
        self.state = next;
        true
    }

    fn fire(&mut self, outcome: TaskOutcome) -> bool {
        match self.callback.take() {
            Some(callback) => {
                callback(outcome);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for TaskInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskInfo")
            .field("id", &self.id())
            .field("task_type", self.task_type())
            .field("state", &self.state)
            .field("cancelled", &self.cancelled)
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::Outcomes;
    use super::*;
    use crate::ports::ChannelProgressSink;

    #[test]
    fn callback_fires_once_on_completion() {
        let outcomes = Outcomes::default();
        let mut info = outcomes.info("render");
        info.mark_processing();

        assert!(info.complete(Ok(serde_json::json!(1))));
        assert!(!info.complete(Ok(serde_json::json!(2))));
        assert_eq!(info.state(), TaskState::Completed);
        assert_eq!(outcomes.for_task(info.id()), vec![Ok(serde_json::json!(1))]);
    }

    #[test]
    fn cancel_runs_cancel_callback_then_reports_cancelled() {
        let outcomes = Outcomes::default();
        let mut info = outcomes.info("render");

        assert!(info.cancel());
        assert!(!info.cancel());
        assert!(info.is_cancelled());
        assert_eq!(info.state(), TaskState::Cancelled);
        assert_eq!(*outcomes.cancel_calls.lock().unwrap(), vec![info.id()]);
        assert_eq!(outcomes.for_task(info.id()), vec![Err(TaskError::Cancelled)]);
    }

    #[test]
    fn result_after_cancel_is_discarded() {
        let outcomes = Outcomes::default();
        let mut info = outcomes.info("render");
        info.mark_processing();
        info.cancel();

        assert!(!info.complete(Ok(serde_json::json!("late"))));
        assert_eq!(outcomes.for_task(info.id()), vec![Err(TaskError::Cancelled)]);
    }

    #[test]
    fn cancel_after_result_is_a_no_op() {
        let outcomes = Outcomes::default();
        let mut info = outcomes.info("render");
        info.mark_processing();
        info.complete(Err(TaskError::Failed("bad input".into())));

        assert!(!info.cancel());
        assert!(outcomes.cancel_calls.lock().unwrap().is_empty());
        assert_eq!(info.state(), TaskState::Errored);
        assert_eq!(outcomes.count(), 1);
    }

    #[test]
    fn processing_is_reported_to_sink() {
        let outcomes = Outcomes::default();
        let (sink, mut rx) = ChannelProgressSink::channel();
        let mut info = outcomes.info_with_sink("render", Some(Arc::new(sink)));

        info.mark_processing();
        let event = rx.try_recv().unwrap();
        assert_eq!(event.task_id, info.id());
        assert_eq!(event.kind, ProgressKind::Processing);
    }
}
