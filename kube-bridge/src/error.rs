//! Error types for kube-bridge

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    /// Actionable failure the user can fix (permissions, exhausted ranges, ...).
    #[error("{0}")]
    InvalidUsage(String),

    /// The peer sent something the tunnel protocol does not allow.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Tunnel error: {0}")]
    Tunnel(String),

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Command `{command}` timed out after {timeout:?}")]
    CommandTimeout { command: String, timeout: Duration },

    #[error("Operation cancelled")]
    Cancelled,
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}
