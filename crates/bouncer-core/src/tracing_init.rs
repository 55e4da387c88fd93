//! Shared tracing/logging initialization.
//!
//! The parent process and every worker subprocess set up `tracing_subscriber`
//! the same way: an env-filter with optional JSON output.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Crates whose log level follows the configured verbosity.
const OWN_CRATES: [&str; 3] = ["spoa_bouncer", "bouncer_daemon", "bouncer_core"];

/// Build the default filter directive for our own crates at `level`
/// (e.g. `"info"` -> `"spoa_bouncer=info,bouncer_daemon=info,bouncer_core=info"`).
pub fn default_filter(level: &str) -> String {
    OWN_CRATES
        .iter()
        .map(|krate| format!("{krate}={level}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set.
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
