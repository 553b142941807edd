//! `spindle` - demo driver for the worker pool and the process-worker entry
//! point.
//!
//! ```text
//! spindle run --mode thread --workers 4 --tasks 32
//! spindle run --mode process --cancel-every 5 --json
//! spindle worker            # spawned by a process-backed pool
//! ```

mod logging;
mod tasks;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use spindle_core::ports::{ProgressSink, TracingProgressSink};
use spindle_core::typed::RegistryError;
use spindle_core::worker::WorkerSpawner;
use spindle_core::{
    BuildError, PoolBuilder, PoolConfig, PoolError, PoolHelper, PoolStats, ProcessSpawner, Task,
    TaskError, TaskId, ThreadSpawner,
};
use tokio::task::JoinSet;
use tracing::{Level, error, info, warn};

use crate::logging::{LogConfig, LogFormat};
use crate::tasks::{ProcessSource, RenderTile};

#[derive(Debug, Parser)]
#[command(name = "spindle", version, about = "Worker pools for CPU-bound tasks")]
struct Cli {
    /// Log output format: pretty, compact or json
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Render synthetic tiles and process synthetic sources on two pools
    Run(RunArgs),
    /// Serve tasks over stdin/stdout; started by process-backed pools
    Worker,
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Worker backend
    #[arg(long, value_enum, default_value_t = Mode::Thread)]
    mode: Mode,

    /// Workers per pool (default: SPINDLE_POOL_SIZE, else cores - 1)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Number of tasks, split between the two pools
    #[arg(short, long, default_value_t = 16)]
    tasks: usize,

    /// Artificial cost of each task
    #[arg(long, default_value_t = 200)]
    work_ms: u64,

    /// Force-cancel every Nth task shortly after submission
    #[arg(long)]
    cancel_every: Option<usize>,

    /// Print the final report as JSON on stdout
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Thread,
    Process,
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("failed to encode report: {0}")]
    Report(#[from] serde_json::Error),
}

#[derive(Debug, Default, Serialize)]
struct Report {
    completed: usize,
    failed: usize,
    cancelled: usize,
    interrupted: bool,
    tiles: Option<PoolStats>,
    sources: Option<PoolStats>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let is_worker = matches!(cli.command, Commands::Worker);
    let mut log = if is_worker {
        LogConfig::for_worker()
    } else {
        LogConfig::default()
    };
    match cli.verbose {
        0 => {}
        1 => log = log.with_level(Level::DEBUG),
        _ => log = log.with_level(Level::TRACE),
    }
    if let Some(format) = cli.log_format {
        log = log.with_format(format);
    }
    logging::init(log.with_env_overrides(cli.log_format.is_some()));

    let result = match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Worker => worker().await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "spindle failed");
            ExitCode::FAILURE
        }
    }
}

async fn worker() -> Result<(), CliError> {
    let registry = Arc::new(tasks::worker_registry()?);
    spindle_core::serve(registry, tokio::io::stdin(), tokio::io::stdout()).await?;
    Ok(())
}

async fn start_helper<S: WorkerSpawner>(
    name: &str,
    config: PoolConfig,
    spawner: S,
    task_type: &str,
) -> Result<PoolHelper, BuildError> {
    let pool = PoolBuilder::new(spawner)
        .name(name)
        .config(config)
        .expect_task_types(&[task_type])
        .build()
        .await?;
    Ok(PoolHelper::new(pool))
}

async fn run(args: RunArgs) -> Result<(), CliError> {
    let mut config = match args.mode {
        Mode::Thread => PoolConfig::for_threads(),
        Mode::Process => PoolConfig::default(),
    }
    .with_env_overrides()?;
    if let Some(workers) = args.workers {
        config = config.size(workers);
    }
    config.validate()?;

    info!(mode = ?args.mode, size = config.size, tasks = args.tasks, "starting pools");
    let (tiles, sources) = match args.mode {
        Mode::Thread => {
            let tiles = ThreadSpawner::new(Arc::new(tasks::tile_registry()?));
            let sources = ThreadSpawner::new(Arc::new(tasks::source_registry()?));
            (
                start_helper("tiles", config.clone(), tiles, RenderTile::TYPE).await?,
                start_helper("sources", config, sources, ProcessSource::TYPE).await?,
            )
        }
        Mode::Process => {
            let spawner = ProcessSpawner::current_exe()?.arg("worker");
            (
                start_helper("tiles", config.clone(), spawner.clone(), RenderTile::TYPE).await?,
                start_helper("sources", config, spawner, ProcessSource::TYPE).await?,
            )
        }
    };

    let progress: Arc<dyn ProgressSink> = Arc::new(TracingProgressSink);
    let mut outcomes = JoinSet::new();
    let mut submitted: Vec<(TaskId, &PoolHelper)> = Vec::with_capacity(args.tasks);

    for i in 0..args.tasks {
        let n = (i / 2) as u32;
        if i % 2 == 0 {
            let tile = RenderTile {
                z: 8,
                x: n % 16,
                y: n / 16,
                size: 256,
                work_ms: args.work_ms,
            };
            let label = format!("tile {}/{}/{}", tile.z, tile.x, tile.y);
            let pending = tiles.submit_with_progress(&tile, progress.clone())?;
            submitted.push((pending.id(), &tiles));
            outcomes.spawn(async move {
                let outcome = pending
                    .await
                    .map(|t| format!("{} px, checksum {:016x}", t.pixels, t.checksum));
                (label, outcome)
            });
        } else {
            // every fifth source is empty and fails
            let source = ProcessSource {
                name: format!("source-{n}"),
                features: if n % 5 == 4 { 0 } else { 1_000 * (n + 1) },
                work_ms: args.work_ms,
            };
            let label = source.name.clone();
            let pending = sources.submit_with_progress(&source, progress.clone())?;
            submitted.push((pending.id(), &sources));
            outcomes.spawn(async move {
                let outcome = pending.await.map(|s| {
                    let [a, b, c, d] = s.extent;
                    format!("{} features, extent [{a:.2}, {b:.2}, {c:.2}, {d:.2}]", s.features)
                });
                (label, outcome)
            });
        }
    }

    if let Some(every) = args.cancel_every.filter(|&n| n > 0) {
        tokio::time::sleep(Duration::from_millis(args.work_ms / 2)).await;
        for (id, helper) in submitted.iter().skip(every - 1).step_by(every) {
            let found = helper.cancel_running(*id).await;
            info!(task_id = %id, pool = helper.pool().name(), found, "cancel requested");
        }
    }

    let mut report = Report::default();
    report.interrupted = tokio::select! {
        _ = collect(&mut outcomes, &mut report) => false,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, closing pools");
            true
        }
    };

    report.tiles = tiles.stats().await;
    report.sources = sources.stats().await;
    tiles.terminate().await;
    sources.terminate().await;
    outcomes.shutdown().await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        info!(
            completed = report.completed,
            failed = report.failed,
            cancelled = report.cancelled,
            "all tasks settled"
        );
    }
    Ok(())
}

async fn collect(
    outcomes: &mut JoinSet<(String, Result<String, TaskError>)>,
    report: &mut Report,
) {
    while let Some(joined) = outcomes.join_next().await {
        match joined {
            Ok((label, Ok(summary))) => {
                report.completed += 1;
                info!(task = %label, "{summary}");
            }
            Ok((label, Err(e))) if e.is_cancelled() => {
                report.cancelled += 1;
                info!(task = %label, "cancelled");
            }
            Ok((label, Err(e))) => {
                report.failed += 1;
                warn!(task = %label, error = %e, "task failed");
            }
            Err(e) => warn!(error = %e, "result collector panicked"),
        }
    }
}
