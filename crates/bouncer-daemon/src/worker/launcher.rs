//! Launching worker processes.

use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{Handoff, WorkerError, WorkerSpec};

/// Exit notice sent by a launched worker's wait task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub name: String,
    /// Exit code (`None` when killed by a signal), or the wait error.
    pub outcome: Result<Option<i32>, String>,
}

/// A launched worker as seen by the manager.
pub trait WorkerProcess: Send + 'static {
    fn pid(&self) -> Option<u32>;

    /// Ask the worker to shut down gracefully. Does not wait for it.
    fn interrupt(&self) -> Result<(), WorkerError>;
}

/// Starts worker processes.
///
/// `launch` must not block: waiting for the process to exit happens on a
/// separate task, which reports through `exits` exactly once.
pub trait Launcher: Send + 'static {
    type Process: WorkerProcess;

    fn launch(
        &self,
        spec: &WorkerSpec,
        handoff: &Handoff,
        exits: mpsc::UnboundedSender<WorkerExit>,
    ) -> Result<Self::Process, WorkerError>;
}

/// Re-executes a program (normally this binary) in worker mode.
#[derive(Debug, Clone)]
pub struct ExecLauncher {
    program: PathBuf,
}

impl ExecLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Launcher for the currently running executable.
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    /// Build the worker command for `spec`.
    ///
    /// The environment is cleared and replaced by the handoff variables, and
    /// the child switches to the spec's uid/gid after fork, before exec.
    /// Standard output and error are shared with the parent.
    pub fn command(&self, spec: &WorkerSpec, handoff: &Handoff) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(spec.worker_args())
            .env_clear()
            .envs(handoff.to_env())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .uid(spec.uid.as_raw())
            .gid(spec.gid.as_raw());
        cmd
    }
}

impl Launcher for ExecLauncher {
    type Process = ExecProcess;

    fn launch(
        &self,
        spec: &WorkerSpec,
        handoff: &Handoff,
        exits: mpsc::UnboundedSender<WorkerExit>,
    ) -> Result<ExecProcess, WorkerError> {
        if spec.uid.is_root() {
            warn!(worker = %spec.name, "Worker runs as root; set worker_user to drop privileges");
        }

        let mut child =
            self.command(spec, handoff)
                .spawn()
                .map_err(|e| WorkerError::LaunchFailed {
                    name: spec.name.clone(),
                    reason: e.to_string(),
                })?;
        let pid = child.id();

        info!(
            worker = %spec.name,
            pid = ?pid,
            uid = spec.uid.as_raw(),
            gid = spec.gid.as_raw(),
            "Worker process started"
        );

        let name = spec.name.clone();
        let (stop_tx, mut stop_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            // Stop requests are handled here; `child.id()` is None once reaped.
            let waited = loop {
                tokio::select! {
                    waited = child.wait() => break waited,
                    Some(()) = stop_rx.recv() => signal_child(&name, &child),
                }
            };
            drop(stop_rx);

            let outcome = match waited {
                Ok(status) => {
                    if status.success() {
                        info!(worker = %name, "Worker exited");
                    } else {
                        error!(
                            worker = %name,
                            code = ?status.code(),
                            signal = ?status.signal(),
                            "Worker exited abnormally"
                        );
                    }
                    Ok(status.code())
                }
                Err(e) => {
                    error!(worker = %name, error = %e, "Failed to wait for worker");
                    Err(e.to_string())
                }
            };
            // The manager is gone once shutdown has begun; nothing to report to.
            let _ = exits.send(WorkerExit { name, outcome });
        });

        Ok(ExecProcess {
            name: spec.name.clone(),
            pid,
            stop: stop_tx,
        })
    }
}

/// Send SIGINT to a child that has not been reaped yet.
fn signal_child(name: &str, child: &Child) {
    let Some(raw) = child.id() else {
        debug!(worker = %name, "Worker already reaped; not signalling");
        return;
    };
    let sent = i32::try_from(raw)
        .map_err(|e| e.to_string())
        .and_then(|pid| kill(Pid::from_raw(pid), Signal::SIGINT).map_err(|e| e.to_string()));
    match sent {
        Ok(()) => debug!(worker = %name, pid = raw, "Sent SIGINT to worker"),
        Err(e) => warn!(worker = %name, pid = raw, error = %e, "Failed to signal worker"),
    }
}

/// Handle to a worker launched by [`ExecLauncher`].
///
/// Interrupts are forwarded to the task that waits on the child; once the
/// child has been reaped they fail instead of signalling a stale pid.
#[derive(Debug)]
pub struct ExecProcess {
    name: String,
    pid: Option<u32>,
    stop: mpsc::UnboundedSender<()>,
}

impl WorkerProcess for ExecProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn interrupt(&self) -> Result<(), WorkerError> {
        self.stop.send(()).map_err(|_| WorkerError::SignalFailed {
            name: self.name.clone(),
            reason: "worker already exited".into(),
        })
    }
}
