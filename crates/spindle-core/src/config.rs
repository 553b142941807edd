//! PoolConfig - sizing and timing knobs for one pool.
//!
//! Deserializable so it can sit inside an application's config file; every
//! field has a default.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::PoolError;

pub const ENV_POOL_SIZE: &str = "SPINDLE_POOL_SIZE";
pub const ENV_DISPATCH_COALESCE_MS: &str = "SPINDLE_DISPATCH_COALESCE_MS";
pub const ENV_RESPAWN_BACKOFF_MS: &str = "SPINDLE_RESPAWN_BACKOFF_MS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of worker slots. Fixed for the pool's lifetime.
    pub size: usize,

    /// Coalescing window for dispatch passes. `0` dispatches immediately
    /// after every state change; larger values batch bursts of submissions
    /// and completions into one pass at the cost of latency.
    pub dispatch_coalesce_ms: u64,

    /// Base delay between attempts to respawn a slot whose replacement
    /// failed to start. Grows linearly, capped at five steps.
    pub respawn_backoff_ms: u64,

    /// Replace a worker that errors or exits. Disable only in tests that
    /// want to observe a shrinking pool.
    pub restart_on_crash: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: default_size(),
            dispatch_coalesce_ms: 0,
            respawn_backoff_ms: 500,
            restart_on_crash: true,
        }
    }
}

/// One core stays free for the process that owns the pool.
fn default_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

impl PoolConfig {
    pub fn with_size(size: usize) -> Self {
        Self {
            size,
            ..Self::default()
        }
    }

    /// Preset for thread pools: short coalescing window, since thread
    /// workers free up quickly and submissions tend to arrive in bursts.
    pub fn for_threads() -> Self {
        Self {
            dispatch_coalesce_ms: 10,
            ..Self::default()
        }
    }

    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn dispatch_coalesce(mut self, window: Duration) -> Self {
        self.dispatch_coalesce_ms = window.as_millis() as u64;
        self
    }

    pub fn respawn_backoff(mut self, delay: Duration) -> Self {
        self.respawn_backoff_ms = delay.as_millis() as u64;
        self
    }

    pub fn restart_on_crash(mut self, enabled: bool) -> Self {
        self.restart_on_crash = enabled;
        self
    }

    pub fn dispatch_coalesce_window(&self) -> Option<Duration> {
        (self.dispatch_coalesce_ms > 0).then(|| Duration::from_millis(self.dispatch_coalesce_ms))
    }

    pub fn respawn_backoff_base(&self) -> Duration {
        Duration::from_millis(self.respawn_backoff_ms)
    }

    /// Apply `SPINDLE_*` environment overrides.
    pub fn with_env_overrides(self) -> Result<Self, PoolError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, PoolError> {
        if let Some(size) = parse_var(&lookup, ENV_POOL_SIZE)? {
            self.size = size;
        }
        if let Some(ms) = parse_var(&lookup, ENV_DISPATCH_COALESCE_MS)? {
            self.dispatch_coalesce_ms = ms;
        }
        if let Some(ms) = parse_var(&lookup, ENV_RESPAWN_BACKOFF_MS)? {
            self.respawn_backoff_ms = ms;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), PoolError> {
        if self.size == 0 {
            return Err(PoolError::InvalidConfig(
                "pool size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, PoolError>
where
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|e| PoolError::InvalidConfig(format!("{key}={raw:?}: {e}")))
}
