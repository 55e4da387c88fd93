//! Task group with first-error cancellation.

use std::fmt;
use std::future::Future;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Which termination request ended the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// SIGTERM
    Terminate,
    /// SIGINT
    Interrupt,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Terminate => f.write_str("SIGTERM"),
            Self::Interrupt => f.write_str("interrupt"),
        }
    }
}

/// Why a grouped task ended early.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// A termination signal arrived. Not a failure.
    #[error("received {0}")]
    Terminated(Termination),

    #[error("{task} failed: {source}")]
    Failed {
        task: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("task panicked or was aborted: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl TaskError {
    pub fn failed(
        task: &'static str,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Failed {
            task,
            source: source.into(),
        }
    }
}

/// How a process wound down without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every task returned on its own.
    Completed,
    /// A termination signal was received.
    Signalled(Termination),
}

/// Turn a group result into a clean outcome, keeping real failures as errors.
pub fn resolve(result: Result<(), TaskError>) -> Result<Outcome, TaskError> {
    match result {
        Ok(()) => Ok(Outcome::Completed),
        Err(TaskError::Terminated(termination)) => {
            info!(signal = %termination, "Received {termination}, shutting down");
            Ok(Outcome::Signalled(termination))
        }
        Err(e) => Err(e),
    }
}

/// Set of tasks sharing one cancellation token.
///
/// [`wait`](Self::wait) joins every task. The first task returning an error
/// cancels the token, and that error is what `wait` returns; later errors
/// are only logged.
pub struct TaskGroup {
    tasks: JoinSet<(&'static str, Result<(), TaskError>)>,
    cancel: CancellationToken,
}

impl TaskGroup {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            tasks: JoinSet::new(),
            cancel,
        }
    }

    /// The group's cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        debug!(task = name, "Starting task");
        self.tasks.spawn(async move { (name, task.await) });
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub async fn wait(mut self) -> Result<(), TaskError> {
        let mut first = None;
        while let Some(joined) = self.tasks.join_next().await {
            let result = match joined {
                Ok((name, result)) => {
                    debug!(task = name, ok = result.is_ok(), "Task finished");
                    result
                }
                Err(e) => Err(TaskError::Join(e)),
            };
            if let Err(e) = result {
                if first.is_none() {
                    self.cancel.cancel();
                    first = Some(e);
                } else {
                    debug!(error = %e, "Additional task error after cancellation");
                }
            }
        }
        first.map_or(Ok(()), Err)
    }
}
