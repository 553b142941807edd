//! Worker adapters.
//!
//! The pool never touches a process or thread directly. It talks to a
//! [`WorkerSpawner`] that starts execution units for numbered slots, and to
//! the [`WorkerHandle`]s it returns. Workers report back through an
//! [`EventSender`] tagged with their `WorkerId`.
//!
//! ```text
//!                 ┌──────────────┐   send / terminate   ┌──────────────┐
//!   add_task ───▶ │     Pool     │ ───────────────────▶ │ WorkerHandle │
//!                 │ (single task)│ ◀─────────────────── │ thread / proc│
//!                 └──────────────┘  message/error/exit  └──────────────┘
//! ```
//!
//! # Implementations
//! - **ThreadSpawner**: one OS thread per slot, in-memory messages, ready
//!   handshake, per-slot capabilities from its `HandlerRegistry`
//! - **ProcessSpawner**: one child process per slot, JSON lines over
//!   stdin/stdout, accepts any task type

mod exec;
pub mod process;
pub mod serve;
pub mod thread;

pub use self::process::{ProcessSpawner, ProcessWorker};
pub use self::serve::serve;
pub use self::thread::{ThreadSpawner, ThreadWorker};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::{Capabilities, PoolError, WorkerId};
use crate::protocol::{WorkerRequest, WorkerResponse};

/// Something a worker reported.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEventKind {
    Message(WorkerResponse),
    Error(String),
    Exit(Option<i32>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerEvent {
    pub worker: WorkerId,
    pub kind: WorkerEventKind,
}

/// Worker-side end of the event channel, tagged with the worker's id.
#[derive(Debug, Clone)]
pub struct EventSender {
    worker: WorkerId,
    tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl EventSender {
    pub fn new(worker: WorkerId, tx: mpsc::UnboundedSender<WorkerEvent>) -> Self {
        Self { worker, tx }
    }

    /// Sender plus the receiving end, for driving an adapter on its own.
    pub fn channel(worker: WorkerId) -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(worker, tx), rx)
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker
    }

    pub fn message(&self, response: WorkerResponse) {
        self.emit(WorkerEventKind::Message(response));
    }

    pub fn error(&self, reason: impl Into<String>) {
        self.emit(WorkerEventKind::Error(reason.into()));
    }

    pub fn exit(&self, code: Option<i32>) {
        self.emit(WorkerEventKind::Exit(code));
    }

    fn emit(&self, kind: WorkerEventKind) {
        // pool gone: nobody left to tell
        let _ = self.tx.send(WorkerEvent {
            worker: self.worker,
            kind,
        });
    }
}

/// One running execution unit.
///
/// A handle answers every `WorkerRequest::Task` with exactly one terminal
/// message, or with an error/exit event.
#[async_trait]
pub trait WorkerHandle: Send + 'static {
    fn send(&mut self, request: WorkerRequest) -> Result<(), PoolError>;

    /// Stop the unit. Events emitted afterwards are ignored by the pool.
    async fn terminate(self) -> Result<(), PoolError>;
}

/// Starts workers for pool slots. A replacement for a slot is spawned with
/// the same slot number, so it gets the same configuration.
#[async_trait]
pub trait WorkerSpawner: Send + Sync + 'static {
    type Handle: WorkerHandle;

    /// Task types the worker in `slot` can run; `None` means any.
    fn capabilities(&self, slot: usize) -> Option<Capabilities>;

    async fn spawn(&self, slot: usize, events: EventSender) -> Result<Self::Handle, PoolError>;
}
