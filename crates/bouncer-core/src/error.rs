//! Error types for the bouncer core library.

use thiserror::Error;

/// Result type alias using the core `Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types.
#[derive(Debug, Error)]
pub enum Error {
    /// Semantic configuration error (missing field, bad combination)
    #[error("Configuration error: {0}")]
    Config(String),

    /// `${VAR}` reference to a variable that is not set
    #[error("Configuration references unset environment variable: {0}")]
    UnsetVariable(String),

    /// TOML parse error
    #[error("Failed to parse configuration: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// TOML render error (merged configuration)
    #[error("Failed to render configuration: {0}")]
    TomlRender(#[from] toml::ser::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
