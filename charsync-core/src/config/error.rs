//! Errors raised while loading, overriding or saving configuration

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read {}: {message}", path.display())]
    Read { path: PathBuf, message: String },

    #[error("Cannot write {}: {message}", path.display())]
    Write { path: PathBuf, message: String },

    #[error("Malformed config file: {0}")]
    Parse(String),

    #[error("Cannot encode config: {0}")]
    Encode(String),

    /// A `CHARSYNC_*` override could not be parsed
    #[error("{var}: {message}")]
    InvalidEnv { var: &'static str, message: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
