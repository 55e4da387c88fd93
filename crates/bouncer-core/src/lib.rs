//! SPOA bouncer core library
//!
//! Shared functionality for the bouncer parent and its worker processes:
//! - TOML configuration loading, `.local` overlays and env expansion
//! - Decision types and the in-memory decision dataset
//! - NDJSON control-plane messages pushed from parent to workers
//! - Common error types and tracing initialisation

pub mod config;
pub mod control;
pub mod dataset;
pub mod decision;
pub mod error;
pub mod tracing_init;

pub use config::BouncerConfig;
pub use control::ControlMessage;
pub use dataset::Dataset;
pub use decision::{Decision, DecisionBatch};
pub use error::{Error, Result};
