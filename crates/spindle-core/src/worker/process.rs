//! Process-backed workers.
//!
//! Each slot runs a child process speaking JSON lines: requests on its stdin,
//! responses on its stdout, logs on the inherited stderr. The child opens
//! with a `ready` line before it gets any work (see [`serve`](super::serve)
//! for the child side).
//!
//! Two tasks per worker:
//! - writer: drains queued request lines into stdin
//! - monitor: owns the child, forwards stdout lines as events, and reports
//!   the exit code once stdout closes

use std::ffi::{OsStr, OsString};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::{EventSender, WorkerHandle, WorkerSpawner};
use crate::domain::{Capabilities, PoolError, WorkerId};
use crate::protocol::{WorkerRequest, WorkerResponse};

/// Environment variable carrying the slot number into the child.
pub const SLOT_ENV: &str = "SPINDLE_WORKER_SLOT";

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

type StdoutLines = Lines<BufReader<ChildStdout>>;

#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    handshake: bool,
    handshake_timeout: Duration,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            handshake: true,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// Re-run the current binary, typically with a worker subcommand.
    pub fn current_exe() -> Result<Self, PoolError> {
        Ok(Self::new(std::env::current_exe()?))
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_owned()));
        self
    }

    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.envs
            .push((key.as_ref().to_owned(), value.as_ref().to_owned()));
        self
    }

    /// Treat the child as ready as soon as it is spawned.
    pub fn without_handshake(mut self) -> Self {
        self.handshake = false;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    fn command(&self, slot: usize) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .env(SLOT_ENV, slot.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    type Handle = ProcessWorker;

    /// A child process can be told to run anything; unknown types come back
    /// as task errors.
    fn capabilities(&self, _slot: usize) -> Option<Capabilities> {
        None
    }

    async fn spawn(&self, slot: usize, events: EventSender) -> Result<ProcessWorker, PoolError> {
        let mut child = self.command(slot).spawn().map_err(|e| PoolError::Spawn {
            slot,
            reason: format!("{}: {e}", self.program.display()),
        })?;
        let pid = child.id();

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(PoolError::Spawn {
                slot,
                reason: "child stdio was not captured".into(),
            });
        };
        let mut lines = BufReader::new(stdout).lines();

        if self.handshake {
            let outcome =
                match tokio::time::timeout(self.handshake_timeout, read_ready(&mut lines)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(format!(
                        "no handshake within {}ms",
                        self.handshake_timeout.as_millis()
                    )),
                };
            if let Err(reason) = outcome {
                if let Err(e) = child.kill().await {
                    debug!(slot, error = %e, "failed to kill worker after bad handshake");
                }
                return Err(PoolError::Handshake { slot, reason });
            }
        }

        let id = events.worker_id();
        debug!(worker_id = %id, slot, pid, program = %self.program.display(), "worker process ready");

        let (lines_tx, lines_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(write_requests(stdin, lines_rx, events.clone()));
        tokio::spawn(monitor(child, lines, kill_rx, events));

        Ok(ProcessWorker {
            id,
            pid,
            lines: lines_tx,
            kill: Some(kill_tx),
        })
    }
}

pub struct ProcessWorker {
    id: WorkerId,
    pid: Option<u32>,
    lines: mpsc::UnboundedSender<String>,
    kill: Option<oneshot::Sender<oneshot::Sender<()>>>,
}

impl ProcessWorker {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

#[async_trait]
impl WorkerHandle for ProcessWorker {
    fn send(&mut self, request: WorkerRequest) -> Result<(), PoolError> {
        let line = request.to_line()?;
        self.lines
            .send(line)
            .map_err(|_| PoolError::Disconnected(self.id))
    }

    /// Kill the child and wait until it is reaped.
    async fn terminate(mut self) -> Result<(), PoolError> {
        let Some(kill) = self.kill.take() else {
            return Ok(());
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        // monitor already gone means the child already exited
        if kill.send(ack_tx).is_ok() {
            let _ = ack_rx.await;
        }
        debug!(worker_id = %self.id, pid = self.pid, "worker process terminated");
        Ok(())
    }
}

async fn read_ready(lines: &mut StdoutLines) -> Result<(), String> {
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return Err("worker exited before handshake".into()),
            Err(e) => return Err(format!("failed to read handshake: {e}")),
        };
        if line.trim().is_empty() {
            continue;
        }
        return match WorkerResponse::from_line(&line) {
            Ok(WorkerResponse::Ready { error: None }) => Ok(()),
            Ok(WorkerResponse::Ready { error: Some(e) }) => Err(e),
            Ok(other) => Err(format!("unexpected handshake message: {other:?}")),
            Err(e) => Err(format!("malformed handshake line: {e}")),
        };
    }
}

async fn write_requests(
    mut stdin: ChildStdin,
    mut lines: mpsc::UnboundedReceiver<String>,
    events: EventSender,
) {
    while let Some(line) = lines.recv().await {
        let written = match stdin.write_all(line.as_bytes()).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            events.error(format!("failed to write to worker stdin: {e}"));
            return;
        }
    }
    // handle dropped: closing stdin tells the child to exit
}

async fn monitor(
    mut child: Child,
    mut lines: StdoutLines,
    mut kill: oneshot::Receiver<oneshot::Sender<()>>,
    events: EventSender,
) {
    loop {
        tokio::select! {
            ack = &mut kill => {
                if let Err(e) = child.kill().await {
                    debug!(worker_id = %events.worker_id(), error = %e, "kill failed");
                }
                if let Ok(ack) = ack {
                    let _ = ack.send(());
                }
                return;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match WorkerResponse::from_line(&line) {
                        Ok(msg) => events.message(msg),
                        Err(e) => warn!(
                            worker_id = %events.worker_id(),
                            error = %e,
                            line = %line.chars().take(200).collect::<String>(),
                            "skipping malformed worker line"
                        ),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    events.error(format!("failed to read worker stdout: {e}"));
                    break;
                }
            }
        }
    }

    // stdout is drained, so every result the child printed is already out
    let code = match child.wait().await {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(worker_id = %events.worker_id(), error = %e, "failed to reap worker process");
            None
        }
    };
    events.exit(code);
}
