//! Parent-to-worker handoff carried in the process environment.
//!
//! The worker may run under a different credential than the parent, so no
//! descriptors are inherited: the worker learns its identity and the path of
//! its rendezvous socket from these variables and dials back itself.

use std::ffi::OsString;
use std::path::PathBuf;

use super::{WorkerError, WorkerSpec};

pub const ENV_WORKER_NAME: &str = "BOUNCER_WORKER_NAME";
pub const ENV_WORKER_SOCKET: &str = "BOUNCER_WORKER_SOCKET";
pub const ENV_LOG_LEVEL: &str = "BOUNCER_LOG_LEVEL";
pub const ENV_LOG_JSON: &str = "BOUNCER_LOG_JSON";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handoff {
    pub worker_name: String,
    /// Rendezvous socket allocated for this worker.
    pub socket: PathBuf,
    pub log_level: Option<String>,
    pub log_json: bool,
}

impl Handoff {
    pub fn new(spec: &WorkerSpec, socket: PathBuf) -> Self {
        Self {
            worker_name: spec.name.clone(),
            socket,
            log_level: spec.log_level.clone(),
            log_json: spec.log_json,
        }
    }

    /// Variables to set on the worker's otherwise empty environment.
    pub fn to_env(&self) -> Vec<(&'static str, OsString)> {
        let mut vars = vec![
            (ENV_WORKER_NAME, OsString::from(&self.worker_name)),
            (ENV_WORKER_SOCKET, self.socket.clone().into_os_string()),
        ];
        if let Some(level) = &self.log_level {
            vars.push((ENV_LOG_LEVEL, OsString::from(level)));
        }
        if self.log_json {
            vars.push((ENV_LOG_JSON, OsString::from("1")));
        }
        vars
    }

    /// Read the handoff of the current (worker) process.
    pub fn from_env() -> Result<Self, WorkerError> {
        Self::from_vars(|name| std::env::var_os(name))
    }

    pub fn from_vars(lookup: impl Fn(&str) -> Option<OsString>) -> Result<Self, WorkerError> {
        let worker_name = lookup(ENV_WORKER_NAME)
            .and_then(|v| v.into_string().ok())
            .filter(|v| !v.is_empty())
            .ok_or(WorkerError::MissingHandoff(ENV_WORKER_NAME))?;
        let socket = lookup(ENV_WORKER_SOCKET)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .ok_or(WorkerError::MissingHandoff(ENV_WORKER_SOCKET))?;
        let log_level = lookup(ENV_LOG_LEVEL)
            .and_then(|v| v.into_string().ok())
            .filter(|v| !v.is_empty());
        let log_json = lookup(ENV_LOG_JSON).is_some_and(|v| v == "1");
        Ok(Self {
            worker_name,
            socket,
            log_level,
            log_json,
        })
    }
}
