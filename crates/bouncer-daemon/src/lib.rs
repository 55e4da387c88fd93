//! SPOA bouncer daemon library
//!
//! The parent process and the worker subprocesses share this library:
//! - Control-socket server allocating per-worker rendezvous sockets
//! - Worker manager spawning privilege-dropped worker processes
//! - Task-group orchestration with signal-to-cancellation translation
//! - Worker runtime serving protocol listeners with bounded graceful shutdown
//! - Decision stream client and the routing layer forwarding decisions to workers

pub mod cli;
pub mod control;
pub mod decisions;
pub mod orchestrator;
pub mod router;
pub mod runtime;
pub mod worker;
