//! Pool - fixed-size worker pool with a FIFO queue.
//!
//! ```text
//!  PoolHandle ──Command──▶ ┌────────────────────┐ ──send──▶ worker slot 0
//!  PoolHandle ──Command──▶ │ PoolActor          │ ──send──▶ worker slot 1
//!                          │  PoolState         │ ◀─event── ...
//!                          │  queue / free list │
//!                          └────────────────────┘
//! ```
//!
//! Every mutation of pool bookkeeping happens on the actor task. Handles are
//! cheap to clone and never block: queries are answered over oneshot
//! channels, and task outcomes arrive through the callback given to
//! [`PoolHandle::add_task`].
//!
//! # Shutdown
//! `close()` drops queued and running tasks **without** calling their
//! callbacks, terminates every worker and stops crash recovery. Callers
//! waiting through [`PoolHelper`](crate::helper::PoolHelper) see the dropped
//! callback as `TaskError::PoolClosed`.

mod actor;
pub mod builder;
pub mod info;
mod state;
pub mod stats;

pub use self::builder::{BuildError, PoolBuilder};
pub use self::info::{CancelCallback, TaskCallback, TaskInfo};
pub use self::stats::PoolStats;

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{Instrument, info, info_span, warn};

use self::actor::{ActorConfig, Command, PoolActor};
use self::state::PoolState;
use crate::config::PoolConfig;
use crate::domain::{PoolError, TaskDescriptor, TaskError, TaskId, TaskType, WorkerId};
use crate::ports::{Clock, IdGenerator, ProgressSink};
use crate::worker::{EventSender, WorkerHandle, WorkerSpawner};

/// Cloneable front door to a running pool.
#[derive(Clone)]
pub struct PoolHandle {
    name: Arc<str>,
    commands: mpsc::UnboundedSender<Command>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl PoolHandle {
    /// Start a pool with the default clock and id generator.
    pub async fn start<S: WorkerSpawner>(
        name: impl Into<String>,
        config: PoolConfig,
        spawner: S,
    ) -> Result<Self, PoolError> {
        PoolBuilder::new(spawner)
            .name(name)
            .config(config)
            .build()
            .await
            .map_err(|e| match e {
                BuildError::Pool(e) => e,
                other => PoolError::InvalidConfig(other.to_string()),
            })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fresh id for a descriptor submitted to this pool.
    pub fn next_task_id(&self) -> TaskId {
        self.ids.generate_task_id()
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Queue a task. Never fails directly: rejections (closed pool, a type
    /// no worker can run) and every later outcome arrive through `callback`,
    /// exactly once, unless the pool is closed while the task is pending.
    pub fn add_task(
        &self,
        task: TaskDescriptor,
        callback: TaskCallback,
        cancel_callback: Option<CancelCallback>,
        progress: Option<Arc<dyn ProgressSink>>,
    ) {
        let info = TaskInfo::new(task, callback, cancel_callback, progress, self.clock.clone());
        if let Err(mpsc::error::SendError(Command::AddTask(info))) =
            self.commands.send(Command::AddTask(info))
        {
            info.reject(TaskError::PoolClosed);
        }
    }

    /// Anything queued or running? `false` once closed.
    pub async fn has_tasks(&self) -> bool {
        self.ask(Command::HasTasks).await.unwrap_or(false)
    }

    /// Cancel a task that has not started. Returns whether it was queued.
    pub async fn cancel_pending_task(&self, id: TaskId) -> bool {
        self.ask(|reply| Command::CancelPending { id, reply })
            .await
            .unwrap_or(false)
    }

    /// Cancel a queued or running task. Returns whether the task was found.
    ///
    /// `force_restart` terminates the worker running it and starts a
    /// replacement; otherwise the worker is asked to stop cooperatively and
    /// stays busy until it answers.
    pub async fn cancel_task(&self, id: TaskId, force_restart: bool) -> bool {
        self.ask(|reply| Command::CancelTask {
            id,
            force_restart,
            reply,
        })
        .await
        .unwrap_or(false)
    }

    /// `None` once the pool is closed.
    pub async fn stats(&self) -> Option<PoolStats> {
        self.ask(Command::Stats).await
    }

    /// Shut the pool down and wait until every worker is terminated.
    /// Idempotent.
    pub async fn close(&self) {
        if let Some(()) = self.ask(Command::Close).await {
            info!(pool = %self.name, "pool closed by handle");
        }
    }

    async fn ask<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(command(reply)).ok()?;
        rx.await.ok()
    }
}

impl std::fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolHandle")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Everything `launch` needs besides the spawner.
pub(crate) struct LaunchParams {
    pub name: String,
    pub config: PoolConfig,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdGenerator>,
}

/// Spawn every slot, wait for all handshakes, then hand the workers to a new
/// actor task. Any slot failing aborts the start and terminates the rest.
pub(crate) async fn launch<S: WorkerSpawner>(
    spawner: S,
    params: LaunchParams,
) -> Result<PoolHandle, PoolError> {
    let LaunchParams {
        name,
        config,
        clock,
        ids,
    } = params;
    config.validate()?;
    let size = config.size;
    let spawner = Arc::new(spawner);
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let mut spawns = JoinSet::new();
    for slot in 0..size {
        let worker = ids.generate_worker_id();
        let events = EventSender::new(worker, events_tx.clone());
        let spawner = spawner.clone();
        spawns.spawn(async move {
            let result = spawner.spawn(slot, events).await;
            (slot, result.map(|handle| (worker, handle)))
        });
    }

    let mut started: Vec<Option<(WorkerId, S::Handle)>> =
        std::iter::repeat_with(|| None).take(size).collect();
    let mut failure = None;
    while let Some(joined) = spawns.join_next().await {
        match joined {
            Ok((slot, Ok(worker))) => started[slot] = Some(worker),
            Ok((slot, Err(e))) => {
                warn!(pool = %name, slot, error = %e, "worker failed to start");
                failure.get_or_insert(e);
            }
            Err(e) => {
                failure.get_or_insert(PoolError::Init(format!("spawn task failed: {e}")));
            }
        }
    }

    if let Some(error) = failure {
        for (worker, handle) in started.into_iter().flatten() {
            if let Err(e) = handle.terminate().await {
                warn!(worker_id = %worker, error = %e, "failed to terminate worker after failed start");
            }
        }
        return Err(error);
    }

    let workers: Vec<(WorkerId, S::Handle)> = started.into_iter().flatten().collect();
    let capabilities = (0..size).map(|slot| spawner.capabilities(slot)).collect();
    let state = PoolState::new(workers, capabilities, config.restart_on_crash);

    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let actor = PoolActor::new(
        spawner,
        ids.clone(),
        state,
        commands_rx,
        (events_tx, events_rx),
        ActorConfig {
            coalesce: config.dispatch_coalesce_window(),
            respawn_backoff: config.respawn_backoff_base(),
        },
    );
    tokio::spawn(actor.run().instrument(info_span!("pool", name = %name)));
    info!(pool = %name, size, "pool started");

    Ok(PoolHandle {
        name: name.into(),
        commands: commands_tx,
        clock,
        ids,
    })
}

/// Task types in `expected` that no slot of `spawner` can run.
pub(crate) fn missing_task_types<S: WorkerSpawner>(
    spawner: &S,
    size: usize,
    expected: &[TaskType],
) -> Vec<TaskType> {
    expected
        .iter()
        .filter(|task_type| {
            !(0..size).any(|slot| {
                crate::domain::accepts(spawner.capabilities(slot).as_ref(), task_type)
            })
        })
        .cloned()
        .collect()
}
