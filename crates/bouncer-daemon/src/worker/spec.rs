//! Worker specification.

use std::ffi::OsString;
use std::net::SocketAddr;
use std::path::PathBuf;

use bouncer_core::config::WorkerConfig;
use nix::unistd::{Gid, Group, Uid, User, getgid, getuid};
use tracing::level_filters::LevelFilter;

use super::WorkerError;

/// OS credential a worker runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerIdentity {
    pub uid: Uid,
    pub gid: Gid,
}

impl WorkerIdentity {
    /// The parent's own real uid/gid.
    pub fn current() -> Self {
        Self {
            uid: getuid(),
            gid: getgid(),
        }
    }

    /// Resolve configured user and group names.
    ///
    /// Without a user the parent's uid is kept; without a group the user's
    /// primary group is used, falling back to the parent's gid.
    pub fn resolve(user: Option<&str>, group: Option<&str>) -> Result<Self, WorkerError> {
        let mut identity = Self::current();

        if let Some(name) = user {
            let user = User::from_name(name)
                .ok()
                .flatten()
                .ok_or_else(|| WorkerError::UnknownIdentity {
                    kind: "user",
                    name: name.to_string(),
                })?;
            identity.uid = user.uid;
            identity.gid = user.gid;
        }

        if let Some(name) = group {
            let group = Group::from_name(name)
                .ok()
                .flatten()
                .ok_or_else(|| WorkerError::UnknownIdentity {
                    kind: "group",
                    name: name.to_string(),
                })?;
            identity.gid = group.gid;
        }

        Ok(identity)
    }
}

/// Description of one worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    /// Unique per run; also names the rendezvous socket.
    pub name: String,
    /// TCP address the worker listens on.
    pub listen_addr: Option<SocketAddr>,
    /// Unix socket path the worker listens on.
    pub listen_socket: Option<PathBuf>,
    /// Log level override passed to the worker.
    pub log_level: Option<String>,
    /// Worker logs as JSON, like the parent.
    pub log_json: bool,
    pub uid: Uid,
    pub gid: Gid,
}

impl WorkerSpec {
    pub fn new(name: impl Into<String>, identity: WorkerIdentity) -> Self {
        Self {
            name: name.into(),
            listen_addr: None,
            listen_socket: None,
            log_level: None,
            log_json: false,
            uid: identity.uid,
            gid: identity.gid,
        }
    }

    pub fn from_config(config: &WorkerConfig, identity: WorkerIdentity) -> Self {
        Self {
            name: config.name.clone(),
            listen_addr: config.listen_addr,
            listen_socket: config.listen_socket.clone(),
            log_level: config.log_level.clone(),
            log_json: false,
            uid: identity.uid,
            gid: identity.gid,
        }
    }

    #[must_use]
    pub const fn with_tcp(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = Some(addr);
        self
    }

    #[must_use]
    pub fn with_unix(mut self, path: impl Into<PathBuf>) -> Self {
        self.listen_socket = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = Some(level.into());
        self
    }

    #[must_use]
    pub const fn with_log_json(mut self, json: bool) -> Self {
        self.log_json = json;
        self
    }

    /// Reject specs that could never serve anything.
    ///
    /// A worker with neither listener would start, connect to its rendezvous
    /// socket and then idle forever, so it is refused here rather than
    /// launched.
    pub fn validate(&self) -> Result<(), WorkerError> {
        let invalid = |reason: &str| WorkerError::InvalidSpec {
            name: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if self.listen_addr.is_none() && self.listen_socket.is_none() {
            return Err(invalid("needs a TCP address or a Unix socket path"));
        }
        if let Some(level) = &self.log_level
            && level.parse::<LevelFilter>().is_err()
        {
            return Err(invalid("unknown log level"));
        }
        Ok(())
    }

    /// Command-line arguments selecting worker mode and this spec's listeners.
    pub fn worker_args(&self) -> Vec<OsString> {
        let mut args = vec![OsString::from("--worker")];
        if let Some(addr) = self.listen_addr {
            args.push("--tcp".into());
            args.push(addr.to_string().into());
        }
        if let Some(path) = &self.listen_socket {
            args.push("--unix".into());
            args.push(path.clone().into_os_string());
        }
        args
    }
}
