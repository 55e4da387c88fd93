//! Worker-mode runtime.
//!
//! A worker serves the protocol on its own listeners, keeps a local copy of
//! the decision dataset fed over its rendezvous socket, and stops on SIGTERM
//! or SIGINT with a bounded graceful shutdown.

pub mod control_client;
mod server;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bouncer_core::Dataset;
use thiserror::Error;
use tokio::sync::{RwLock, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span};

pub use server::{
    ConnectionHandler, DrainHandler, ProtocolServer, ServeError, ShutdownError, SpoaServer,
};

use crate::orchestrator::{Outcome, SignalListener, TaskError, TaskGroup, resolve};
use crate::worker::{Handoff, WorkerError};

/// Time a stopping worker gives open connections to finish.
pub const GRACEFUL_SHUTDOWN: Duration = Duration::from_secs(5);

/// Lifecycle of a worker runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Starting,
    Serving,
    Draining,
    Stopped,
}

/// Worker runtime errors.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Serve(#[from] ServeError),

    #[error(transparent)]
    Shutdown(#[from] ShutdownError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Handoff(#[from] WorkerError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// Process exit code: 2 when the grace period ran out, 1 otherwise.
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Shutdown(ShutdownError::DeadlineExceeded { .. }) => 2,
            _ => 1,
        }
    }
}

/// Drives a [`ProtocolServer`] from serving to a bounded shutdown.
pub struct WorkerRuntime<S> {
    server: Arc<S>,
    grace: Duration,
    state: watch::Sender<RuntimeState>,
}

impl<S: ProtocolServer> WorkerRuntime<S> {
    pub fn new(server: S) -> Self {
        Self {
            server: Arc::new(server),
            grace: GRACEFUL_SHUTDOWN,
            state: watch::Sender::new(RuntimeState::Starting),
        }
    }

    #[must_use]
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn state(&self) -> watch::Receiver<RuntimeState> {
        self.state.subscribe()
    }

    /// Serve both listeners inside `group`, then shut the server down once
    /// the group's scope is cancelled.
    ///
    /// A termination signal from the group is a clean stop. A serve failure
    /// takes precedence over a shutdown failure.
    pub async fn run(self, mut group: TaskGroup) -> Result<(), RuntimeError> {
        let cancel = group.token();

        let server = Arc::clone(&self.server);
        let token = cancel.clone();
        group.spawn("serve-tcp", async move {
            server
                .serve_tcp(token)
                .await
                .map_err(|e| TaskError::failed("serve-tcp", e))
        });

        let server = Arc::clone(&self.server);
        let token = cancel.clone();
        group.spawn("serve-unix", async move {
            server
                .serve_unix(token)
                .await
                .map_err(|e| TaskError::failed("serve-unix", e))
        });

        self.state.send_replace(RuntimeState::Serving);
        let served = resolve(group.wait().await);

        self.state.send_replace(RuntimeState::Draining);
        info!(grace_secs = self.grace.as_secs(), "Draining protocol connections");
        let shutdown = self.server.shutdown(self.grace).await;
        self.state.send_replace(RuntimeState::Stopped);

        match (served, shutdown) {
            (Ok(outcome), Ok(())) => {
                match outcome {
                    Outcome::Signalled(signal) => info!(%signal, "Worker stopped"),
                    Outcome::Completed => info!("Worker stopped"),
                }
                Ok(())
            }
            (Err(e), shutdown) => {
                if let Err(extra) = shutdown {
                    error!(error = %extra, "Shutdown also failed");
                }
                Err(e.into())
            }
            (Ok(_), Err(e)) => Err(e.into()),
        }
    }
}

/// Run this process as the worker described by `handoff`.
pub async fn execute(
    handoff: Handoff,
    tcp: Option<SocketAddr>,
    unix: Option<PathBuf>,
) -> Result<(), RuntimeError> {
    let span = info_span!("worker", name = %handoff.worker_name);
    async move {
        let signals = SignalListener::install()?;
        let server = SpoaServer::bind(tcp, unix.as_deref(), DrainHandler).await?;

        let cancel = CancellationToken::new();
        let mut group = TaskGroup::new(cancel.clone());
        group.spawn("signals", signals.wait(cancel.clone()));

        let dataset = Arc::new(RwLock::new(Dataset::new()));
        let socket = handoff.socket;
        let token = cancel.clone();
        group.spawn("control-client", async move {
            control_client::run(&socket, dataset, token).await
        });

        info!(pid = std::process::id(), "Worker starting");
        WorkerRuntime::new(server).run(group).await
    }
    .instrument(span)
    .await
}
