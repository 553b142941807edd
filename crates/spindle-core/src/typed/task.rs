//! Task trait - binds a request type to its task_type and result type.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::TaskType;

/// A typed unit of work.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct RenderTile { z: u8, x: u32, y: u32 }
///
/// impl Task for RenderTile {
///     const TYPE: &'static str = "tile.render";
///     type Output = Vec<u8>;
/// }
/// ```
///
/// Requests and outputs cross a process boundary in the process-backed pool,
/// hence the serde bounds.
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// task_type used for dispatch and capability matching.
    const TYPE: &'static str;

    type Output: Serialize + DeserializeOwned + Send + 'static;

    fn task_type() -> TaskType {
        TaskType::new(Self::TYPE)
    }
}
