//! Translation of termination signals into group cancellation.

use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{TaskError, Termination};

/// SIGTERM and SIGINT listeners.
///
/// The OS handlers are registered by [`install`](Self::install), so a signal
/// delivered between installation and [`wait`](Self::wait) is not lost.
pub struct SignalListener {
    terminate: Signal,
    interrupt: Signal,
}

impl SignalListener {
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
        })
    }

    /// Resolve to [`TaskError::Terminated`] on the first signal, or `Ok` once
    /// `cancel` fires for another reason.
    pub async fn wait(mut self, cancel: CancellationToken) -> Result<(), TaskError> {
        tokio::select! {
            _ = self.terminate.recv() => Err(TaskError::Terminated(Termination::Terminate)),
            _ = self.interrupt.recv() => Err(TaskError::Terminated(Termination::Interrupt)),
            () = cancel.cancelled() => {
                debug!("Signal listener stopping");
                Ok(())
            }
        }
    }
}
