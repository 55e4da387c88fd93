//! Worker processes: specification, launch, supervision.
//!
//! Workers are re-executions of this binary in `--worker` mode, running
//! under the configured worker user and group. The [`WorkerManager`] owns
//! every running worker; other tasks only talk to it through a
//! [`ManagerHandle`].

mod error;
mod handoff;
mod launcher;
mod manager;
mod spec;

pub use error::WorkerError;
pub use handoff::{ENV_LOG_JSON, ENV_LOG_LEVEL, ENV_WORKER_NAME, ENV_WORKER_SOCKET, Handoff};
pub use launcher::{ExecLauncher, ExecProcess, Launcher, WorkerExit, WorkerProcess};
pub use manager::{ManagerHandle, WorkerManager, WorkerStatus, WorkerTicket};
pub use spec::{WorkerIdentity, WorkerSpec};
