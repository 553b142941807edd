//! Point-in-time pool counters for status displays and logs.

use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Configured slot count.
    pub size: usize,
    /// Slots with a running worker.
    pub live: usize,
    pub idle: usize,
    pub busy: usize,
    /// Slots waiting for a replacement worker.
    pub starting: usize,
    pub queued: usize,

    pub completed: u64,
    /// Handler errors, worker faults and rejected submissions.
    pub failed: u64,
    pub cancelled: u64,
    /// Replacement workers started after a crash or forced cancel.
    pub respawns: u64,
}

impl PoolStats {
    /// Anything queued or running?
    pub fn has_work(&self) -> bool {
        self.queued > 0 || self.busy > 0
    }
}
