//! Child side of a process worker.
//!
//! `serve` reads `WorkerRequest` lines from `input` and writes
//! `WorkerResponse` lines to `output`. Handlers run on the blocking pool so
//! cancel requests keep flowing while a task is busy. Stdout belongs to the
//! protocol; log to stderr.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::exec;
use crate::domain::{PoolError, TaskId};
use crate::protocol::{WorkerRequest, WorkerResponse};
use crate::typed::{CancelSignal, HandlerRegistry, Reporter};

enum Outbound {
    Response(WorkerResponse),
    Panicked(String),
}

/// Tasks this worker is executing, with their cancel flags.
///
/// A cancel only flags a task that is still in flight. Cancels that arrive
/// after the task finished are dropped instead of piling up in the signal.
#[derive(Default)]
struct InFlight {
    ids: HashSet<TaskId>,
    cancel: CancelSignal,
}

impl InFlight {
    fn start(&mut self, id: TaskId) -> CancelSignal {
        self.ids.insert(id);
        self.cancel.clone()
    }

    fn cancel(&self, id: TaskId) -> bool {
        let running = self.ids.contains(&id);
        if running {
            self.cancel.cancel(id);
        }
        running
    }

    fn finish(&mut self, id: TaskId) {
        self.ids.remove(&id);
        self.cancel.clear(id);
    }

    fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Run the worker loop until the input closes or an `exit` request arrives.
///
/// Tasks already running when input ends are finished and reported first.
/// A panicking handler ends the loop with [`PoolError::HandlerPanicked`];
/// the parent sees the process exit and fails the task.
pub async fn serve<R, W>(
    registry: Arc<HandlerRegistry>,
    input: R,
    mut output: W,
) -> Result<(), PoolError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if let Err(e) = registry.init_all() {
        let reason = e.to_string();
        write_line(
            &mut output,
            &WorkerResponse::Ready {
                error: Some(reason.clone()),
            },
        )
        .await?;
        return Err(PoolError::Init(reason));
    }
    write_line(&mut output, &WorkerResponse::ready()).await?;
    info!(task_types = registry.len(), "worker ready");

    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let reporter: Reporter = {
        let out_tx = out_tx.clone();
        Arc::new(move |msg| {
            let _ = out_tx.send(Outbound::Response(msg));
        })
    };

    let mut lines = BufReader::new(input).lines();
    let mut input_open = true;
    let mut in_flight = InFlight::default();

    while input_open || !in_flight.is_empty() {
        tokio::select! {
            line = lines.next_line(), if input_open => {
                let Some(line) = line? else {
                    debug!("input closed");
                    input_open = false;
                    continue;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match WorkerRequest::from_line(&line) {
                    Ok(WorkerRequest::Task { id, task_type, payload }) => {
                        debug!(task_id = %id, task_type = %task_type, "task received");
                        let cancel = in_flight.start(id);
                        let registry = registry.clone();
                        let reporter = reporter.clone();
                        let out_tx = out_tx.clone();
                        tokio::task::spawn_blocking(move || {
                            let out = match exec::execute(&registry, id, &task_type, payload, &cancel, reporter) {
                                Ok(response) => Outbound::Response(response),
                                Err(panic) => Outbound::Panicked(panic),
                            };
                            let _ = out_tx.send(out);
                        });
                    }
                    Ok(WorkerRequest::Cancel { id }) => {
                        if in_flight.cancel(id) {
                            debug!(task_id = %id, "cancel requested");
                        } else {
                            debug!(task_id = %id, "ignoring cancel for a task that is not running");
                        }
                    }
                    Ok(WorkerRequest::Exit) => {
                        debug!("exit requested");
                        input_open = false;
                    }
                    Err(e) => warn!(error = %e, "skipping malformed request line"),
                }
            }
            Some(out) = out_rx.recv() => match out {
                Outbound::Response(msg) => {
                    if msg.is_terminal()
                        && let Some(id) = msg.task_id()
                    {
                        in_flight.finish(id);
                    }
                    write_line(&mut output, &msg).await?;
                }
                Outbound::Panicked(reason) => return Err(PoolError::HandlerPanicked(reason)),
            },
        }
    }

    info!("worker exiting");
    Ok(())
}

async fn write_line<W: AsyncWrite + Unpin>(
    output: &mut W,
    msg: &WorkerResponse,
) -> Result<(), PoolError> {
    output.write_all(msg.to_line()?.as_bytes()).await?;
    output.flush().await?;
    Ok(())
}
