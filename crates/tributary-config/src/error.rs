//! Configuration error types

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or validating a [`TributaryConfig`](crate::TributaryConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A config file exists but could not be read.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A config file is not valid TOML for the expected schema.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// Values parse but the pipeline cannot run with them.
    #[error("invalid configuration: {0}")]
    ValidationError(String),

    /// The platform's user config directory could not be determined.
    #[error("config directory lookup failed: {0}")]
    XdgError(String),
}
