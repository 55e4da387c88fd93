//! Parent-process orchestration.
//!
//! Every long-running task shares one cancellation scope through a
//! [`TaskGroup`]. The first task to fail cancels the rest; a termination
//! signal is reported as a tagged [`TaskError::Terminated`] and resolves to a
//! clean [`Outcome`] instead of an error.

mod group;
mod parent;
mod signals;

pub use group::{Outcome, TaskError, TaskGroup, Termination, resolve};
pub use parent::run_parent;
pub use signals::SignalListener;
