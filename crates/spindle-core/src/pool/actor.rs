//! The pool task: single owner of `PoolState`.
//!
//! Three inputs, polled with events first so a worker's answer is applied
//! before the next command looks at the state:
//! - worker events (message / error / exit)
//! - finished replacement spawns
//! - commands from `PoolHandle`s
//!
//! After every input the actor runs (or schedules, when coalescing) a
//! dispatch pass and then carries out the effects the state recorded.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::info::TaskInfo;
use super::state::{Effect, PoolState};
use super::stats::PoolStats;
use crate::domain::{PoolError, TaskId, WorkerId};
use crate::ports::IdGenerator;
use crate::worker::{EventSender, WorkerEvent, WorkerHandle, WorkerSpawner};

/// Backoff for a failing slot grows linearly up to this many steps.
const MAX_BACKOFF_STEPS: u32 = 5;

pub(crate) enum Command {
    AddTask(TaskInfo),
    HasTasks(oneshot::Sender<bool>),
    CancelPending {
        id: TaskId,
        reply: oneshot::Sender<bool>,
    },
    CancelTask {
        id: TaskId,
        force_restart: bool,
        reply: oneshot::Sender<bool>,
    },
    Stats(oneshot::Sender<PoolStats>),
    Close(oneshot::Sender<()>),
}

struct Spawned<H> {
    slot: usize,
    result: Result<(WorkerId, H), PoolError>,
}

pub(crate) struct PoolActor<S: WorkerSpawner> {
    spawner: Arc<S>,
    ids: Arc<dyn IdGenerator>,
    state: PoolState<S::Handle>,
    commands: mpsc::UnboundedReceiver<Command>,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    spawned_tx: mpsc::UnboundedSender<Spawned<S::Handle>>,
    spawned: mpsc::UnboundedReceiver<Spawned<S::Handle>>,
    terminations: JoinSet<()>,
    coalesce: Option<Duration>,
    dispatch_at: Option<Instant>,
    respawn_backoff: Duration,
}

pub(crate) struct ActorConfig {
    pub coalesce: Option<Duration>,
    pub respawn_backoff: Duration,
}

impl<S: WorkerSpawner> PoolActor<S> {
    pub(crate) fn new(
        spawner: Arc<S>,
        ids: Arc<dyn IdGenerator>,
        state: PoolState<S::Handle>,
        commands: mpsc::UnboundedReceiver<Command>,
        events: (
            mpsc::UnboundedSender<WorkerEvent>,
            mpsc::UnboundedReceiver<WorkerEvent>,
        ),
        config: ActorConfig,
    ) -> Self {
        let (events_tx, events) = events;
        let (spawned_tx, spawned) = mpsc::unbounded_channel();
        Self {
            spawner,
            ids,
            state,
            commands,
            events_tx,
            events,
            spawned_tx,
            spawned,
            terminations: JoinSet::new(),
            coalesce: config.coalesce,
            dispatch_at: None,
            respawn_backoff: config.respawn_backoff,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            let deadline = self.dispatch_at.unwrap_or_else(Instant::now);
            tokio::select! {
                biased;

                Some(event) = self.events.recv() => self.state.on_event(event),
                Some(spawned) = self.spawned.recv() => {
                    self.state.on_spawned(spawned.slot, spawned.result)
                }
                command = self.commands.recv() => match command {
                    Some(Command::Close(reply)) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(command) => self.handle(command),
                    None => {
                        debug!("all pool handles dropped");
                        self.shutdown().await;
                        return;
                    }
                },
                _ = tokio::time::sleep_until(deadline), if self.dispatch_at.is_some() => {
                    self.dispatch_at = None;
                    let assigned = self.state.dispatch();
                    debug!(assigned, "coalesced dispatch");
                }
                Some(joined) = self.terminations.join_next(), if !self.terminations.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "worker termination task failed");
                    }
                }
            }
            self.schedule_dispatch();
            self.apply_effects();
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::AddTask(info) => self.state.add_task(info),
            Command::HasTasks(reply) => {
                let _ = reply.send(self.state.has_tasks());
            }
            Command::CancelPending { id, reply } => {
                let _ = reply.send(self.state.cancel_pending(id));
            }
            Command::CancelTask {
                id,
                force_restart,
                reply,
            } => {
                let _ = reply.send(self.state.cancel_task(id, force_restart));
            }
            Command::Stats(reply) => {
                let _ = reply.send(self.state.stats());
            }
            // only reached while draining after shutdown
            Command::Close(reply) => {
                let _ = reply.send(());
            }
        }
    }

    fn schedule_dispatch(&mut self) {
        if self.state.is_closing() || !self.state.needs_dispatch() {
            return;
        }
        match self.coalesce {
            None => {
                self.state.dispatch();
            }
            Some(window) => {
                if self.dispatch_at.is_none() {
                    self.dispatch_at = Some(Instant::now() + window);
                }
            }
        }
    }

    fn apply_effects(&mut self) {
        for effect in self.state.take_effects() {
            match effect {
                Effect::Terminate { worker, handle } => {
                    self.terminations.spawn(async move {
                        if let Err(e) = handle.terminate().await {
                            warn!(worker_id = %worker, error = %e, "failed to terminate worker");
                        }
                    });
                }
                Effect::Respawn { slot, attempt } => self.respawn(slot, attempt),
            }
        }
    }

    fn respawn(&self, slot: usize, attempt: u32) {
        let delay = self.respawn_backoff * attempt.min(MAX_BACKOFF_STEPS);
        let worker = self.ids.generate_worker_id();
        let events = EventSender::new(worker, self.events_tx.clone());
        let spawner = self.spawner.clone();
        let spawned = self.spawned_tx.clone();
        debug!(worker_id = %worker, slot, attempt, delay_ms = delay.as_millis() as u64, "spawning replacement worker");
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let result = spawner
                .spawn(slot, events)
                .await
                .map(|handle| (worker, handle));
            if let Err(Spawned {
                result: Ok((worker, handle)),
                ..
            }) = spawned.send(Spawned { slot, result }).map_err(|e| e.0)
            {
                // pool is gone
                let _ = handle.terminate().await;
                debug!(worker_id = %worker, "terminated replacement for a stopped pool");
            }
        });
    }

    async fn shutdown(&mut self) {
        self.commands.close();
        self.state.close();
        self.dispatch_at = None;
        self.apply_effects();
        while let Some(joined) = self.terminations.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "worker termination task failed");
            }
        }
        // commands sent before the channel closed still get an answer
        while let Ok(command) = self.commands.try_recv() {
            self.handle(command);
        }
        info!("pool closed");
    }
}
