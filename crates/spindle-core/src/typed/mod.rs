//! Typed - typed task API used on both sides of the pool.
//!
//! # Two layers
//! - **Typed**: `Task`, `Handler<T>` - what applications write
//! - **Dyn**: `DynHandler` - object-safe, JSON based, what workers store
//!
//! Callers submit `Task` values through a `PoolHelper`; workers execute them
//! through a `HandlerRegistry`.

pub mod context;
pub mod handler;
pub mod registry;
pub mod task;

pub use self::context::{CancelSignal, Reporter, TaskContext};
pub use self::handler::{DynHandler, Handler, HandlerError, TypedHandler};
pub use self::registry::{HandlerRegistry, RegistryError};
pub use self::task::Task;
