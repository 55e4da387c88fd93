//! Worker error types.

use crate::control::ControlError;

/// Errors from worker validation, launch and supervision.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Invalid worker spec '{name}': {reason}")]
    InvalidSpec { name: String, reason: String },

    #[error("Worker name already used in this run: {0}")]
    DuplicateName(String),

    #[error("Rendezvous allocation failed: {0}")]
    Rendezvous(#[from] ControlError),

    #[error("Failed to launch worker '{name}': {reason}")]
    LaunchFailed { name: String, reason: String },

    #[error("Failed to signal worker '{name}': {reason}")]
    SignalFailed { name: String, reason: String },

    #[error("Unknown {kind} '{name}'")]
    UnknownIdentity { kind: &'static str, name: String },

    #[error("Worker environment is missing {0}")]
    MissingHandoff(&'static str),

    #[error("Worker manager has stopped")]
    ManagerStopped,
}
