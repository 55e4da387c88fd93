//! SPOA bouncer
//!
//! The parent process pulls decisions from the local API and supervises one
//! worker process per configured listener. Workers are this same binary
//! re-executed with `--worker`, under the configured worker user and group.

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use bouncer_core::BouncerConfig;
use bouncer_core::tracing_init::{default_filter, init_tracing};
use bouncer_daemon::cli::{Args, Mode};
use bouncer_daemon::orchestrator::{Outcome, run_parent};
use bouncer_daemon::runtime;
use bouncer_daemon::worker::{Handoff, WorkerIdentity};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let mode = match args.mode() {
        Ok(mode) => mode,
        Err(e) => {
            init_tracing(&default_filter("info"), false);
            error!(error = %e, "Invalid arguments");
            return ExitCode::FAILURE;
        }
    };

    match mode {
        Mode::Parent {
            config,
            test_config,
            show_config,
        } => parent(&config, args.verbose, test_config, show_config).await,
        Mode::Worker { tcp, unix } => {
            let handoff = match Handoff::from_env() {
                Ok(handoff) => handoff,
                Err(e) => {
                    init_tracing(&default_filter("info"), false);
                    error!(error = %e, "Worker started without a handoff");
                    return ExitCode::FAILURE;
                }
            };
            let level = handoff.log_level.as_deref().unwrap_or("info");
            init_tracing(&default_filter(level), handoff.log_json);

            match runtime::execute(handoff, tcp, unix).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!(error = %e, "Worker failed");
                    ExitCode::from(e.exit_code())
                }
            }
        }
    }
}

async fn parent(path: &Path, verbose: bool, test_config: bool, show_config: bool) -> ExitCode {
    if show_config {
        return match bouncer_core::config::merged_config(path) {
            Ok(merged) => {
                print_config(&merged);
                ExitCode::SUCCESS
            }
            Err(e) => {
                init_tracing(&default_filter("info"), false);
                error!(error = %e, config = %path.display(), "Failed to read configuration");
                ExitCode::FAILURE
            }
        };
    }

    let config = match BouncerConfig::load(path) {
        Ok(config) => config,
        Err(e) => {
            init_tracing(&default_filter("info"), false);
            error!(error = %e, config = %path.display(), "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let level = if verbose { "debug" } else { config.log_level.as_str() };
    init_tracing(&default_filter(level), config.log_json);

    if test_config {
        info!(config = %path.display(), workers = config.workers.len(), "Configuration is valid");
        return ExitCode::SUCCESS;
    }

    let identity = match WorkerIdentity::resolve(
        config.worker_user.as_deref(),
        config.worker_group.as_deref(),
    ) {
        Ok(identity) => identity,
        Err(e) => {
            error!(error = %e, "Invalid worker identity");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %path.display(),
        workers = config.workers.len(),
        uid = identity.uid.as_raw(),
        gid = identity.gid.as_raw(),
        "Starting spoa-bouncer"
    );

    match run_parent(config, identity).await {
        Ok(Outcome::Signalled(signal)) => {
            info!(%signal, "Bouncer stopped");
            ExitCode::SUCCESS
        }
        Ok(Outcome::Completed) => {
            info!("Bouncer stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Bouncer failed");
            ExitCode::FAILURE
        }
    }
}

#[allow(clippy::print_stdout)]
fn print_config(merged: &str) {
    print!("{merged}");
}
