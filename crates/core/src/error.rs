//! Error types for configuration loading

use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Clone, Debug, Error)]
pub enum ConfigError {
    /// The configuration text could not be parsed.
    #[error("failed to parse configuration: {0}")]
    Parse(String),

    /// A duration that must be positive was zero.
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    /// The server name was empty.
    #[error("serverName must not be empty")]
    EmptyServerName,
}
