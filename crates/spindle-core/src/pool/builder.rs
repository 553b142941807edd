//! PoolBuilder - pool construction and wiring.
//!
//! # Fail-fast
//! `expect_task_types()` lists the task types the application is going to
//! submit. `build()` checks them against the spawner's per-slot capabilities
//! before any worker is started, so a missing handler registration shows up
//! at startup instead of as `TaskError::Unsupported` on the first submission.

use std::sync::Arc;

use super::{LaunchParams, PoolHandle, launch, missing_task_types};
use crate::config::PoolConfig;
use crate::domain::{PoolError, TaskType};
use crate::ports::{Clock, IdGenerator, SystemClock, UlidGenerator};
use crate::worker::WorkerSpawner;

/// Builds and starts a pool.
///
/// # Example
/// ```ignore
/// let pool = PoolBuilder::new(ThreadSpawner::new(registry))
///     .name("tiles")
///     .config(PoolConfig::for_threads().size(4))
///     .expect_task_types(&["tile.render"])
///     .build()
///     .await?;
/// ```
pub struct PoolBuilder<S> {
    spawner: S,
    name: String,
    config: PoolConfig,
    clock: Arc<dyn Clock>,
    ids: Option<Arc<dyn IdGenerator>>,
    expected: Option<Vec<TaskType>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing task types: {0:?}. No worker slot can run these expected task types.")]
    MissingTaskTypes(Vec<String>),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl<S: WorkerSpawner> PoolBuilder<S> {
    pub fn new(spawner: S) -> Self {
        Self {
            spawner,
            name: "pool".to_string(),
            config: PoolConfig::default(),
            clock: Arc::new(SystemClock),
            ids: None,
            expected: None,
        }
    }

    /// Name used in logs.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Clock for progress timestamps (and ids, unless `id_generator` is set).
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn expect_task_types(mut self, task_types: &[&str]) -> Self {
        self.expected = Some(task_types.iter().map(|&t| TaskType::new(t)).collect());
        self
    }

    /// Validate, spawn every worker and wait for their handshakes.
    pub async fn build(self) -> Result<PoolHandle, BuildError> {
        if let Some(expected) = &self.expected {
            let missing = missing_task_types(&self.spawner, self.config.size, expected);
            if !missing.is_empty() {
                return Err(BuildError::MissingTaskTypes(
                    missing.into_iter().map(|t| t.as_str().to_string()).collect(),
                ));
            }
        }

        let clock = self.clock;
        let ids: Arc<dyn IdGenerator> = match self.ids {
            Some(ids) => ids,
            None => Arc::new(UlidGenerator::new(clock.clone())),
        };
        let handle = launch(
            self.spawner,
            LaunchParams {
                name: self.name,
                config: self.config,
                clock,
                ids,
            },
        )
        .await?;
        Ok(handle)
    }
}
