//! Command-line arguments shared by the parent and worker modes.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use thiserror::Error;

#[derive(Parser, Debug)]
#[command(name = "spoa-bouncer")]
#[command(version, about = "SPOA bouncer - serves CrowdSec decisions to a reverse proxy")]
pub struct Args {
    /// Configuration file
    #[arg(short = 'c', long, env = "BOUNCER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Raise the default log level to debug
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Check the configuration and exit
    #[arg(short = 't', long)]
    pub test_config: bool,

    /// Print the merged configuration and exit
    #[arg(short = 'T', long)]
    pub show_config: bool,

    /// Run as a worker (set by the parent when re-executing itself)
    #[arg(long, hide = true)]
    pub worker: bool,

    /// TCP address a worker serves the protocol on
    #[arg(long, hide = true)]
    pub tcp: Option<SocketAddr>,

    /// Unix socket a worker serves the protocol on
    #[arg(long, hide = true)]
    pub unix: Option<PathBuf>,
}

/// What this process was asked to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Parent {
        config: PathBuf,
        test_config: bool,
        show_config: bool,
    },
    Worker {
        tcp: Option<SocketAddr>,
        unix: Option<PathBuf>,
    },
}

/// Invalid flag combinations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModeError {
    #[error("--tcp and --unix are only valid with --worker")]
    ListenerWithoutWorker,

    #[error("--worker requires --tcp or --unix")]
    WorkerWithoutListener,

    #[error("a configuration file is required (-c <path>)")]
    MissingConfig,
}

impl Args {
    pub fn mode(&self) -> Result<Mode, ModeError> {
        let has_listener = self.tcp.is_some() || self.unix.is_some();
        if self.worker {
            if !has_listener {
                return Err(ModeError::WorkerWithoutListener);
            }
            return Ok(Mode::Worker {
                tcp: self.tcp,
                unix: self.unix.clone(),
            });
        }
        if has_listener {
            return Err(ModeError::ListenerWithoutWorker);
        }
        let config = self.config.clone().ok_or(ModeError::MissingConfig)?;
        Ok(Mode::Parent {
            config,
            test_config: self.test_config,
            show_config: self.show_config,
        })
    }
}
