use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use super::TaskId;

/// Tag a worker dispatches on (e.g. `"tile.render"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskType(String);

impl TaskType {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for TaskType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// TaskType + payload + id: the immutable unit handed to a worker.
///
/// The payload is opaque to the pool; only the worker-side handler for
/// `task_type` knows its shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    id: TaskId,
    task_type: TaskType,
    payload: serde_json::Value,
}

impl TaskDescriptor {
    pub fn new(id: TaskId, task_type: TaskType, payload: serde_json::Value) -> Self {
        Self {
            id,
            task_type,
            payload,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn task_type(&self) -> &TaskType {
        &self.task_type
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn into_parts(self) -> (TaskId, TaskType, serde_json::Value) {
        (self.id, self.task_type, self.payload)
    }
}

/// Set of task types a worker declares it can execute.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities(BTreeSet<TaskType>);

impl Capabilities {
    pub fn new<I, T>(types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskType>,
    {
        Self(types.into_iter().map(Into::into).collect())
    }

    pub fn accepts(&self, task_type: &TaskType) -> bool {
        self.0.contains(task_type)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskType> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<TaskType> for Capabilities {
    fn from_iter<I: IntoIterator<Item = TaskType>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// `None` means "runs anything" (process workers).
pub fn accepts(capabilities: Option<&Capabilities>, task_type: &TaskType) -> bool {
    capabilities.is_none_or(|caps| caps.accepts(task_type))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrestricted_worker_accepts_everything() {
        assert!(accepts(None, &TaskType::new("anything")));
    }

    #[test]
    fn capabilities_filter_by_type() {
        let caps = Capabilities::new(["render"]);
        assert!(accepts(Some(&caps), &TaskType::new("render")));
        assert!(!accepts(Some(&caps), &TaskType::new("process")));
    }

    #[test]
    fn descriptor_exposes_parts() {
        let id = TaskId::generate();
        let d = TaskDescriptor::new(id, TaskType::new("render"), serde_json::json!({"z": 3}));
        assert_eq!(d.id(), id);
        assert_eq!(d.task_type().as_str(), "render");
        assert_eq!(d.payload()["z"], 3);
    }
}
