//! Thread-backed workers.
//!
//! Each slot runs one dedicated OS thread that owns a `HandlerRegistry`.
//! A thread declares the task types of its registry as its capabilities and
//! must pass a ready handshake (running every handler's `init`) before the
//! pool may use it.
//!
//! OS threads cannot be killed from outside. `terminate` therefore retires
//! the thread: it flags the running task as cancelled, closes the request
//! channel and silences the thread's events. The thread exits as soon as its
//! current handler returns; cooperative handlers return early.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::exec;
use super::{EventSender, WorkerHandle, WorkerSpawner};
use crate::domain::{Capabilities, PoolError, TaskId, WorkerId};
use crate::protocol::{WorkerRequest, WorkerResponse};
use crate::typed::{CancelSignal, HandlerRegistry, Reporter};

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Spawns worker threads. Slot `n` uses registry `n % registries.len()`.
pub struct ThreadSpawner {
    registries: Vec<Arc<HandlerRegistry>>,
    handshake_timeout: Duration,
    stack_size: Option<usize>,
}

impl ThreadSpawner {
    /// Every slot runs the same registry.
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self::per_slot(vec![registry])
    }

    /// Slot-specific registries, e.g. one specialised renderer thread next to
    /// general-purpose processing threads.
    pub fn per_slot(registries: Vec<Arc<HandlerRegistry>>) -> Self {
        Self {
            registries,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            stack_size: None,
        }
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    fn registry(&self, slot: usize) -> Option<&Arc<HandlerRegistry>> {
        if self.registries.is_empty() {
            return None;
        }
        self.registries.get(slot % self.registries.len())
    }
}

#[async_trait]
impl WorkerSpawner for ThreadSpawner {
    type Handle = ThreadWorker;

    fn capabilities(&self, slot: usize) -> Option<Capabilities> {
        Some(
            self.registry(slot)
                .map(|r| r.capabilities())
                .unwrap_or_default(),
        )
    }

    async fn spawn(&self, slot: usize, events: EventSender) -> Result<ThreadWorker, PoolError> {
        let registry = self.registry(slot).cloned().ok_or_else(|| PoolError::Spawn {
            slot,
            reason: "no handler registry configured".into(),
        })?;

        let id = events.worker_id();
        let (requests_tx, requests_rx) = std_mpsc::channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let cancel = CancelSignal::default();
        let retired = Arc::new(AtomicBool::new(false));

        let mut builder = std::thread::Builder::new().name(format!("spindle-worker-{slot}"));
        if let Some(bytes) = self.stack_size {
            builder = builder.stack_size(bytes);
        }
        let thread = builder
            .spawn({
                let cancel = cancel.clone();
                let retired = retired.clone();
                move || worker_thread(registry, requests_rx, events, ready_tx, cancel, retired)
            })
            .map_err(|e| PoolError::Spawn {
                slot,
                reason: e.to_string(),
            })?;

        let handshake = match tokio::time::timeout(self.handshake_timeout, ready_rx).await {
            Ok(Ok(WorkerResponse::Ready { error: None })) => Ok(()),
            Ok(Ok(WorkerResponse::Ready { error: Some(reason) })) => Err(reason),
            Ok(Ok(other)) => Err(format!("unexpected handshake message: {other:?}")),
            Ok(Err(_)) => Err("worker thread exited before handshake".to_string()),
            Err(_) => Err(format!(
                "no handshake within {}ms",
                self.handshake_timeout.as_millis()
            )),
        };

        let worker = ThreadWorker {
            id,
            requests: requests_tx,
            cancel,
            retired,
            running: None,
            thread: Some(thread),
        };
        match handshake {
            Ok(()) => {
                debug!(worker_id = %id, slot, "worker thread ready");
                Ok(worker)
            }
            Err(reason) => {
                worker.retire();
                Err(PoolError::Handshake { slot, reason })
            }
        }
    }
}

pub struct ThreadWorker {
    id: WorkerId,
    requests: std_mpsc::Sender<WorkerRequest>,
    cancel: CancelSignal,
    retired: Arc<AtomicBool>,
    running: Option<TaskId>,
    thread: Option<JoinHandle<()>>,
}

impl ThreadWorker {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    fn retire(mut self) {
        self.retired.store(true, Ordering::SeqCst);
        if let Some(id) = self.running.take() {
            self.cancel.cancel(id);
        }
        // dropping `requests` ends the thread's receive loop
        if let Some(thread) = self.thread.take() {
            if thread.is_finished() {
                if thread.join().is_err() {
                    warn!(worker_id = %self.id, "retired worker thread had panicked");
                }
            } else {
                debug!(worker_id = %self.id, "detaching busy worker thread");
            }
        }
    }
}

#[async_trait]
impl WorkerHandle for ThreadWorker {
    fn send(&mut self, request: WorkerRequest) -> Result<(), PoolError> {
        match request {
            // the thread is inside the handler; flip the flag it polls
            WorkerRequest::Cancel { id } => {
                if self.running == Some(id) {
                    self.cancel.cancel(id);
                } else {
                    debug!(worker_id = %self.id, task_id = %id, "ignoring cancel for a task this worker never ran");
                }
                Ok(())
            }
            request => {
                if let WorkerRequest::Task { id, .. } = &request {
                    self.running = Some(*id);
                }
                self.requests
                    .send(request)
                    .map_err(|_| PoolError::Disconnected(self.id))
            }
        }
    }

    async fn terminate(self) -> Result<(), PoolError> {
        self.retire();
        Ok(())
    }
}

fn worker_thread(
    registry: Arc<HandlerRegistry>,
    requests: std_mpsc::Receiver<WorkerRequest>,
    events: EventSender,
    ready: oneshot::Sender<WorkerResponse>,
    cancel: CancelSignal,
    retired: Arc<AtomicBool>,
) {
    if let Err(e) = registry.init_all() {
        let _ = ready.send(WorkerResponse::Ready {
            error: Some(e.to_string()),
        });
        return;
    }
    if ready.send(WorkerResponse::ready()).is_err() {
        // spawner gave up waiting
        return;
    }

    let reporter: Reporter = {
        let events = events.clone();
        let retired = retired.clone();
        Arc::new(move |msg| {
            if !retired.load(Ordering::SeqCst) {
                events.message(msg);
            }
        })
    };

    while let Ok(request) = requests.recv() {
        match request {
            WorkerRequest::Task {
                id,
                task_type,
                payload,
            } => {
                cancel.retain_only(id);
                let outcome =
                    exec::execute(&registry, id, &task_type, payload, &cancel, reporter.clone());
                if retired.load(Ordering::SeqCst) {
                    return;
                }
                match outcome {
                    Ok(response) => events.message(response),
                    Err(panic) => {
                        events.error(format!("handler panicked: {panic}"));
                        events.exit(None);
                        return;
                    }
                }
            }
            WorkerRequest::Cancel { id } => cancel.cancel(id),
            WorkerRequest::Exit => break,
        }
    }

    if !retired.load(Ordering::SeqCst) {
        events.exit(Some(0));
    }
}
