//! spindle-core
//!
//! Fixed-size pools of isolated workers (threads or child processes) for
//! CPU-bound, long-running tasks.
//!
//! # Modules
//! - **domain**: ids, task descriptors, task state, progress events, errors
//! - **ports**: Clock, IdGenerator, ProgressSink
//! - **typed**: typed task API (Task trait, Handler trait, HandlerRegistry)
//! - **protocol**: pool <-> worker messages and their JSON-lines encoding
//! - **worker**: WorkerHandle / WorkerSpawner and the thread and process adapters
//! - **pool**: the scheduler (PoolBuilder, PoolHandle)
//! - **helper**: typed, awaitable per-feature facade over one pool
//! - **config**: PoolConfig

pub mod config;
pub mod domain;
pub mod helper;
pub mod pool;
pub mod ports;
pub mod protocol;
pub mod typed;
pub mod worker;

pub use crate::config::PoolConfig;
pub use crate::domain::{
    Capabilities, PoolError, ProgressEvent, ProgressKind, TaskDescriptor, TaskError, TaskId,
    TaskOutcome, TaskType, WorkerId,
};
pub use crate::helper::{PendingTask, PoolHelper};
pub use crate::pool::{BuildError, PoolBuilder, PoolHandle, PoolStats};
pub use crate::typed::{Handler, HandlerError, HandlerRegistry, Task, TaskContext};
pub use crate::worker::{ProcessSpawner, ThreadSpawner, serve};
