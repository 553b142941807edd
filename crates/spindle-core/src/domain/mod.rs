//! Domain model (ids, task descriptors, state, progress events, errors).

pub mod errors;
pub mod events;
pub mod ids;
pub mod state;
pub mod task;

pub use self::errors::{PoolError, TaskError, TaskOutcome};
pub use self::events::{ProgressEvent, ProgressKind};
pub use self::ids::{Id, IdMarker, ParseIdError, TaskId, WorkerId};
pub use self::state::TaskState;
pub use self::task::{Capabilities, TaskDescriptor, TaskType, accepts};
