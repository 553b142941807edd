//! Demo workload: synthetic tile rendering and source processing.
//!
//! Both handlers are deliberately CPU-bound, report progress and poll for
//! cancellation between chunks of work.

use std::ops::Range;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use spindle_core::typed::RegistryError;
use spindle_core::{Handler, HandlerError, HandlerRegistry, Task, TaskContext};

/// Render one `size`x`size` tile of a synthetic raster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderTile {
    pub z: u8,
    pub x: u32,
    pub y: u32,
    pub size: u32,
    /// Artificial cost per tile.
    pub work_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileSummary {
    pub z: u8,
    pub x: u32,
    pub y: u32,
    pub pixels: u64,
    pub checksum: u64,
}

impl Task for RenderTile {
    const TYPE: &'static str = "tile.render";
    type Output = TileSummary;
}

/// Scan a synthetic vector source and compute its extent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSource {
    pub name: String,
    pub features: u32,
    pub work_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSummary {
    pub name: String,
    pub features: u32,
    /// min_x, min_y, max_x, max_y
    pub extent: [f64; 4],
}

impl Task for ProcessSource {
    const TYPE: &'static str = "source.process";
    type Output = SourceSummary;
}

const STEPS: u32 = 10;

fn pause(work_ms: u64) {
    if work_ms > 0 {
        std::thread::sleep(Duration::from_millis(work_ms / u64::from(STEPS)));
    }
}

/// The slice of `0..total` handled in `step`. Computed in u64 so sizes near
/// `u32::MAX` cannot overflow.
fn step_range(step: u32, total: u32) -> Range<u64> {
    let total = u64::from(total);
    let per_step = total.div_ceil(u64::from(STEPS));
    let first = (u64::from(step) * per_step).min(total);
    first..(first + per_step).min(total)
}

pub struct TileRenderer;

impl Handler<RenderTile> for TileRenderer {
    fn handle(&self, task: RenderTile, ctx: &TaskContext) -> Result<TileSummary, HandlerError> {
        if task.size == 0 {
            return Err(HandlerError::failed("tile size must be positive"));
        }
        let size = u64::from(task.size);
        let mut checksum: u64 = 0xcbf2_9ce4_8422_2325;

        for step in 0..STEPS {
            if ctx.is_cancelled() {
                return Err(HandlerError::Cancelled);
            }
            for row in step_range(step, task.size) {
                for col in 0..size {
                    let px = (u64::from(task.x) * size + col)
                        ^ ((u64::from(task.y) * size + row) << 20)
                        ^ (u64::from(task.z) << 40);
                    checksum = (checksum ^ px).wrapping_mul(0x0100_0000_01b3);
                }
            }
            pause(task.work_ms);
            ctx.report(
                format!("rendering {}/{}/{}", task.z, task.x, task.y),
                Some((step + 1) as f32 * 100.0 / STEPS as f32),
            );
        }

        Ok(TileSummary {
            z: task.z,
            x: task.x,
            y: task.y,
            pixels: size * size,
            checksum,
        })
    }
}

pub struct SourceProcessor;

impl Handler<ProcessSource> for SourceProcessor {
    fn handle(
        &self,
        task: ProcessSource,
        ctx: &TaskContext,
    ) -> Result<SourceSummary, HandlerError> {
        if task.features == 0 {
            return Err(HandlerError::failed(format!(
                "source '{}' has no features",
                task.name
            )));
        }

        let mut extent = [f64::MAX, f64::MAX, f64::MIN, f64::MIN];
        let mut seed = task
            .name
            .bytes()
            .fold(0x9e37_79b9_u64, |h, b| h.rotate_left(5) ^ u64::from(b));

        for step in 0..STEPS {
            if ctx.is_cancelled() {
                return Err(HandlerError::Cancelled);
            }
            for _ in step_range(step, task.features) {
                seed = seed
                    .wrapping_mul(6_364_136_223_846_793_005)
                    .wrapping_add(1_442_695_040_888_963_407);
                let lon = (seed >> 32) as f64 / f64::from(u32::MAX) * 360.0 - 180.0;
                let lat = (seed & 0xffff_ffff) as f64 / f64::from(u32::MAX) * 170.0 - 85.0;
                extent[0] = extent[0].min(lon);
                extent[1] = extent[1].min(lat);
                extent[2] = extent[2].max(lon);
                extent[3] = extent[3].max(lat);
            }
            pause(task.work_ms);
            ctx.report(
                format!("processing {}", task.name),
                Some((step + 1) as f32 * 100.0 / STEPS as f32),
            );
        }

        Ok(SourceSummary {
            name: task.name,
            features: task.features,
            extent,
        })
    }
}

pub fn tile_registry() -> Result<HandlerRegistry, RegistryError> {
    HandlerRegistry::new().with::<RenderTile, _>(TileRenderer)
}

pub fn source_registry() -> Result<HandlerRegistry, RegistryError> {
    HandlerRegistry::new().with::<ProcessSource, _>(SourceProcessor)
}

/// Everything a `spindle worker` process can run.
pub fn worker_registry() -> Result<HandlerRegistry, RegistryError> {
    tile_registry()?.with::<ProcessSource, _>(SourceProcessor)
}
