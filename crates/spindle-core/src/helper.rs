//! PoolHelper - typed, awaitable front end for one pool.
//!
//! Each feature (tile rendering, source processing, ...) owns its own
//! helper and therefore its own pool. The helper turns `Task` values into
//! descriptors with fresh ids and turns callbacks into futures.
//!
//! ```ignore
//! let tiles = PoolHelper::start("tiles", PoolConfig::for_threads(), spawner).await?;
//! let pending = tiles.submit(&RenderTile { z: 3, x: 1, y: 2 })?;
//! let id = pending.id();            // keep for cancel()
//! let png: Vec<u8> = pending.await?;
//! ```

use std::future::{Future, IntoFuture};
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio::sync::oneshot;

use crate::config::PoolConfig;
use crate::domain::{PoolError, TaskDescriptor, TaskError, TaskId, TaskOutcome, TaskType};
use crate::pool::{PoolHandle, PoolStats};
use crate::ports::ProgressSink;
use crate::typed::Task;
use crate::worker::WorkerSpawner;

#[derive(Debug, Clone)]
pub struct PoolHelper {
    pool: PoolHandle,
}

impl PoolHelper {
    pub fn new(pool: PoolHandle) -> Self {
        Self { pool }
    }

    pub async fn start<S: WorkerSpawner>(
        name: impl Into<String>,
        config: PoolConfig,
        spawner: S,
    ) -> Result<Self, PoolError> {
        Ok(Self::new(PoolHandle::start(name, config, spawner).await?))
    }

    pub fn pool(&self) -> &PoolHandle {
        &self.pool
    }

    /// Queue `task`. Fails only if the task cannot be serialized.
    pub fn submit<T: Task>(&self, task: &T) -> Result<PendingTask<T::Output>, TaskError> {
        self.submit_typed(task, None)
    }

    /// Like `submit`, with queued/processing/status/cancelling notifications
    /// sent to `progress`.
    pub fn submit_with_progress<T: Task>(
        &self,
        task: &T,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<PendingTask<T::Output>, TaskError> {
        self.submit_typed(task, Some(progress))
    }

    /// Untyped submission; the result stays JSON.
    pub fn submit_json(
        &self,
        task_type: TaskType,
        payload: serde_json::Value,
        progress: Option<Arc<dyn ProgressSink>>,
    ) -> PendingTask<serde_json::Value> {
        let id = self.pool.next_task_id();
        let (tx, rx) = oneshot::channel();
        self.pool.add_task(
            TaskDescriptor::new(id, task_type, payload),
            Box::new(move |outcome| {
                // caller may have stopped waiting
                let _ = tx.send(outcome);
            }),
            None,
            progress,
        );
        PendingTask::new(id, rx)
    }

    fn submit_typed<T: Task>(
        &self,
        task: &T,
        progress: Option<Arc<dyn ProgressSink>>,
    ) -> Result<PendingTask<T::Output>, TaskError> {
        let payload = serde_json::to_value(task).map_err(|e| TaskError::Encode(e.to_string()))?;
        Ok(self.submit_json(T::task_type(), payload, progress).typed())
    }

    /// Cancel a task that has not started yet.
    pub async fn cancel(&self, id: TaskId) -> bool {
        self.pool.cancel_pending_task(id).await
    }

    /// Cancel a task even if it is running, restarting its worker.
    pub async fn cancel_running(&self, id: TaskId) -> bool {
        self.pool.cancel_task(id, true).await
    }

    pub async fn has_tasks(&self) -> bool {
        self.pool.has_tasks().await
    }

    pub async fn stats(&self) -> Option<PoolStats> {
        self.pool.stats().await
    }

    /// Close the pool. Outstanding `PendingTask`s resolve to
    /// `TaskError::PoolClosed`.
    pub async fn terminate(&self) {
        self.pool.close().await
    }
}

/// A submitted task. Await it (or call `wait`) for the decoded output.
#[must_use = "dropping a PendingTask does not cancel the task"]
pub struct PendingTask<O> {
    id: TaskId,
    rx: oneshot::Receiver<TaskOutcome>,
    _output: PhantomData<fn() -> O>,
}

impl<O> PendingTask<O> {
    fn new(id: TaskId, rx: oneshot::Receiver<TaskOutcome>) -> Self {
        Self {
            id,
            rx,
            _output: PhantomData,
        }
    }

    fn typed<U>(self) -> PendingTask<U> {
        PendingTask::new(self.id, self.rx)
    }

    pub fn id(&self) -> TaskId {
        self.id
    }
}

impl<O: DeserializeOwned> PendingTask<O> {
    pub async fn wait(self) -> Result<O, TaskError> {
        // callback dropped unfired: the pool closed with this task pending
        let value = self.rx.await.map_err(|_| TaskError::PoolClosed)??;
        serde_json::from_value(value).map_err(|e| TaskError::Decode(e.to_string()))
    }
}

impl<O: DeserializeOwned + Send + 'static> IntoFuture for PendingTask<O> {
    type Output = Result<O, TaskError>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ProgressKind;
    use crate::ports::ChannelProgressSink;
    use crate::typed::handler::fixtures::{ShoutHandler, SquareHandler};
    use crate::typed::task::fixtures::{Shout, Square};
    use crate::typed::{Handler, HandlerError, HandlerRegistry, TaskContext};
    use crate::worker::ThreadSpawner;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    /// Same task_type as `Square`, but expects a string back.
    #[derive(Serialize, Deserialize)]
    struct SquareAsText {
        value: i64,
    }

    impl Task for SquareAsText {
        const TYPE: &'static str = Square::TYPE;
        type Output = String;
    }

    #[derive(Serialize, Deserialize)]
    struct Hold {
        millis: u64,
    }

    impl Task for Hold {
        const TYPE: &'static str = "test.hold";
        type Output = u64;
    }

    struct HoldHandler;

    impl Handler<Hold> for HoldHandler {
        fn handle(&self, task: Hold, ctx: &TaskContext) -> Result<u64, HandlerError> {
            for _ in 0..task.millis / 5 {
                if ctx.is_cancelled() {
                    return Err(HandlerError::Cancelled);
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(task.millis)
        }
    }

    async fn helper(size: usize) -> PoolHelper {
        let registry = HandlerRegistry::new()
            .with::<Square, _>(SquareHandler)
            .unwrap()
            .with::<Shout, _>(ShoutHandler)
            .unwrap()
            .with::<Hold, _>(HoldHandler)
            .unwrap();
        PoolHelper::start(
            "test",
            PoolConfig::with_size(size),
            ThreadSpawner::new(Arc::new(registry)),
        )
        .await
        .unwrap()
    }

    async fn within<F: IntoFuture>(f: F) -> F::Output {
        tokio::time::timeout(Duration::from_secs(10), f.into_future())
            .await
            .expect("future resolved in time")
    }

    #[tokio::test]
    async fn submit_resolves_with_typed_output() {
        let helper = helper(2).await;
        let result = within(helper.submit(&Square { value: 9 }).unwrap()).await;
        assert_eq!(result, Ok(81));
        assert!(!helper.has_tasks().await);
        helper.terminate().await;
    }

    #[tokio::test]
    async fn handler_error_is_task_failure() {
        let helper = helper(1).await;
        let result = within(helper.submit(&Shout { text: String::new() }).unwrap()).await;
        assert_eq!(result, Err(TaskError::Failed("nothing to shout".into())));
        helper.terminate().await;
    }

    #[tokio::test]
    async fn mismatched_output_is_decode_error() {
        let helper = helper(1).await;
        let result = within(helper.submit(&SquareAsText { value: 2 }).unwrap()).await;
        assert!(matches!(result, Err(TaskError::Decode(_))));
        helper.terminate().await;
    }

    #[tokio::test]
    async fn unknown_task_type_is_unsupported() {
        let helper = helper(1).await;
        let pending = helper.submit_json(TaskType::new("nobody.handles"), serde_json::json!({}), None);
        assert_eq!(
            within(pending).await,
            Err(TaskError::Unsupported(TaskType::new("nobody.handles")))
        );
        helper.terminate().await;
    }

    #[tokio::test]
    async fn cancel_pending_and_running() {
        let helper = helper(1).await;
        let running = helper.submit(&Hold { millis: 5_000 }).unwrap();
        let queued = helper.submit(&Hold { millis: 5_000 }).unwrap();
        let (running_id, queued_id) = (running.id(), queued.id());

        assert!(helper.cancel(queued_id).await);
        assert_eq!(within(queued).await, Err(TaskError::Cancelled));

        // a running task is out of reach for a plain cancel
        assert!(!helper.cancel(running_id).await);
        assert!(helper.cancel_running(running_id).await);
        assert_eq!(within(running).await, Err(TaskError::Cancelled));

        // the slot comes back with a fresh worker
        assert_eq!(within(helper.submit(&Square { value: 3 }).unwrap()).await, Ok(9));
        let stats = helper.stats().await.unwrap();
        assert_eq!(stats.size, 1);
        assert_eq!(stats.respawns, 1);
        helper.terminate().await;
    }

    #[tokio::test]
    async fn progress_reaches_the_sink() {
        let helper = helper(1).await;
        let (sink, mut rx) = ChannelProgressSink::channel();
        let pending = helper
            .submit_with_progress(&Square { value: 4 }, Arc::new(sink))
            .unwrap();
        assert_eq!(within(pending).await, Ok(16));

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind);
        }
        assert_eq!(kinds[0], ProgressKind::Queued);
        assert_eq!(kinds[1], ProgressKind::Processing);
        assert!(matches!(&kinds[2], ProgressKind::Status { message, .. } if message == "squaring"));
        helper.terminate().await;
    }

    #[tokio::test]
    async fn terminate_resolves_outstanding_tasks_as_closed() {
        let helper = helper(1).await;
        let running = helper.submit(&Hold { millis: 5_000 }).unwrap();
        let queued = helper.submit(&Hold { millis: 5_000 }).unwrap();

        helper.terminate().await;
        assert_eq!(within(running).await, Err(TaskError::PoolClosed));
        assert_eq!(within(queued).await, Err(TaskError::PoolClosed));

        let late = helper.submit(&Square { value: 1 }).unwrap();
        assert_eq!(within(late).await, Err(TaskError::PoolClosed));
        assert!(!helper.has_tasks().await);
        assert!(helper.pool().is_closed());
    }
}
