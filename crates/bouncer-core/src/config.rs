//! Configuration loading for the bouncer.
//!
//! Resolution order:
//! 1. The main TOML file given with `-c`
//! 2. An optional `<file>.local` overlay, deep-merged over the main file
//! 3. Strict `${VAR}` expansion from the environment
//! 4. Deserialization and validation

use std::collections::HashSet;
use std::ffi::OsString;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

use crate::error::{Error, Result};

/// Default directory holding the workers' rendezvous sockets.
pub const DEFAULT_WORKER_SOCKET_DIR: &str = "/run/crowdsec-spoa";

/// Complete bouncer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BouncerConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_json: bool,
    /// Directory where rendezvous sockets are created, one per worker.
    #[serde(default = "default_worker_socket_dir")]
    pub worker_socket_dir: PathBuf,
    /// OS user workers run as. Defaults to the parent's own user.
    #[serde(default)]
    pub worker_user: Option<String>,
    /// OS group workers run as. Defaults to `worker_user`'s primary group,
    /// or the parent's own group.
    #[serde(default)]
    pub worker_group: Option<String>,
    pub api: ApiConfig,
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
}

/// Decision stream (local API) connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub url: String,
    pub key: String,
    #[serde(default = "default_update_frequency")]
    pub update_frequency_secs: u64,
}

/// One `[[workers]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub name: String,
    #[serde(default)]
    pub listen_addr: Option<SocketAddr>,
    #[serde(default)]
    pub listen_socket: Option<PathBuf>,
    #[serde(default)]
    pub log_level: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_worker_socket_dir() -> PathBuf {
    PathBuf::from(DEFAULT_WORKER_SOCKET_DIR)
}

const fn default_update_frequency() -> u64 {
    10
}

impl BouncerConfig {
    /// Load, merge, expand, parse and validate the configuration at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let merged = merged_config(path)?;
        let expanded = expand_env(&merged, |name| std::env::var(name).ok())?;
        Self::from_toml_str(&expanded)
    }

    /// Parse and validate an already expanded TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants serde cannot express.
    pub fn validate(&self) -> Result<()> {
        check_level(&self.log_level, "log_level")?;
        if self.api.url.trim().is_empty() {
            return Err(Error::Config("api.url must not be empty".into()));
        }
        if self.api.key.trim().is_empty() {
            return Err(Error::Config("api.key must not be empty".into()));
        }
        if self.api.update_frequency_secs == 0 {
            return Err(Error::Config(
                "api.update_frequency_secs must be at least 1".into(),
            ));
        }

        let mut names = HashSet::new();
        for worker in &self.workers {
            if worker.name.trim().is_empty() {
                return Err(Error::Config("worker name must not be empty".into()));
            }
            if !names.insert(worker.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate worker name '{}'",
                    worker.name
                )));
            }
            if worker.listen_addr.is_none() && worker.listen_socket.is_none() {
                return Err(Error::Config(format!(
                    "worker '{}' needs listen_addr or listen_socket",
                    worker.name
                )));
            }
            if let Some(level) = &worker.log_level {
                check_level(level, &format!("workers.{}.log_level", worker.name))?;
            }
        }
        Ok(())
    }
}

fn check_level(level: &str, field: &str) -> Result<()> {
    level
        .parse::<LevelFilter>()
        .map(|_| ())
        .map_err(|_| Error::Config(format!("{field}: unknown log level '{level}'")))
}

/// Path of the overlay file for `path` (`bouncer.toml` -> `bouncer.toml.local`).
pub fn local_overlay_path(path: &Path) -> PathBuf {
    let mut local = OsString::from(path.as_os_str());
    local.push(".local");
    PathBuf::from(local)
}

/// Read `path` and deep-merge `<path>.local` over it when that file exists.
///
/// Tables merge key by key; any other value (arrays included) in the overlay
/// replaces the base value. Returns the merged document as TOML text.
pub fn merged_config(path: &Path) -> Result<String> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {e}", path.display()))
    })?;

    let overlay_path = local_overlay_path(path);
    if !overlay_path.exists() {
        return Ok(content);
    }

    let mut base: toml::Table = content.parse()?;
    let overlay: toml::Table = std::fs::read_to_string(&overlay_path)?.parse()?;
    merge_tables(&mut base, overlay);
    Ok(toml::to_string(&base)?)
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Replace every `${NAME}` in `content` using `lookup`.
///
/// Expansion is strict: a reference to a variable `lookup` cannot resolve is
/// an error rather than an empty string.
pub fn expand_env(content: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<String> {
    let pattern = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .map_err(|e| Error::Config(e.to_string()))?;

    let mut expanded = String::with_capacity(content.len());
    let mut last = 0;
    for caps in pattern.captures_iter(content) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let value =
            lookup(name.as_str()).ok_or_else(|| Error::UnsetVariable(name.as_str().to_string()))?;
        expanded.push_str(&content[last..whole.start()]);
        expanded.push_str(&value);
        last = whole.end();
    }
    expanded.push_str(&content[last..]);
    Ok(expanded)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [api]
        url = "http://127.0.0.1:8080"
        key = "secret"
    "#;

    fn with_workers(workers: &str) -> String {
        format!("{MINIMAL}\n{workers}")
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config = BouncerConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.log_level, "info");
        assert!(!config.log_json);
        assert_eq!(config.worker_socket_dir, PathBuf::from(DEFAULT_WORKER_SOCKET_DIR));
        assert_eq!(config.api.update_frequency_secs, 10);
        assert!(config.workers.is_empty());
    }

    #[test]
    fn parses_workers() {
        let config = BouncerConfig::from_toml_str(&with_workers(
            r#"
            [[workers]]
            name = "w1"
            listen_addr = "127.0.0.1:9000"

            [[workers]]
            name = "w2"
            listen_socket = "/run/spoa/w2.sock"
            log_level = "debug"
            "#,
        ))
        .unwrap();
        assert_eq!(config.workers.len(), 2);
        assert_eq!(
            config.workers[0].listen_addr,
            Some("127.0.0.1:9000".parse().unwrap())
        );
        assert_eq!(config.workers[1].log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn worker_without_listener_is_rejected() {
        let err = BouncerConfig::from_toml_str(&with_workers(
            r#"
            [[workers]]
            name = "idle"
            "#,
        ))
        .unwrap_err();
        assert!(err.to_string().contains("listen_addr or listen_socket"));
    }

    #[test]
    fn duplicate_worker_names_are_rejected() {
        let err = BouncerConfig::from_toml_str(&with_workers(
            r#"
            [[workers]]
            name = "w1"
            listen_addr = "127.0.0.1:9000"

            [[workers]]
            name = "w1"
            listen_addr = "127.0.0.1:9001"
            "#,
        ))
        .unwrap_err();
        assert!(err.to_string().contains("duplicate worker name"));
    }

    #[test]
    fn unknown_log_level_is_rejected() {
        let err = BouncerConfig::from_toml_str(&format!("log_level = \"loud\"\n{MINIMAL}"))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn expand_env_is_strict() {
        let lookup = |name: &str| (name == "API_KEY").then(|| "s3cr3t".to_string());
        assert_eq!(
            expand_env("key = \"${API_KEY}\"", lookup).unwrap(),
            "key = \"s3cr3t\""
        );
        let err = expand_env("key = \"${MISSING}\"", lookup).unwrap_err();
        assert!(matches!(err, Error::UnsetVariable(name) if name == "MISSING"));
    }

    #[test]
    fn expand_env_leaves_plain_dollars() {
        let out = expand_env("a = \"$HOME and ${X}\"", |_| Some("x".into())).unwrap();
        assert_eq!(out, "a = \"$HOME and x\"");
    }

    #[test]
    fn local_overlay_is_deep_merged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bouncer.toml");
        std::fs::write(
            &path,
            r#"
            log_level = "info"
            [api]
            url = "http://127.0.0.1:8080"
            key = "base"
            "#,
        )
        .unwrap();
        std::fs::write(
            local_overlay_path(&path),
            r#"
            [api]
            key = "local"
            "#,
        )
        .unwrap();

        let merged = merged_config(&path).unwrap();
        let config = BouncerConfig::from_toml_str(&merged).unwrap();
        assert_eq!(config.api.key, "local");
        assert_eq!(config.api.url, "http://127.0.0.1:8080");
    }

    #[test]
    fn missing_overlay_returns_file_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bouncer.toml");
        std::fs::write(&path, MINIMAL).unwrap();
        assert_eq!(merged_config(&path).unwrap(), MINIMAL);
    }
}
