//! Configuration error types.

use thiserror::Error;

/// Errors loading or resolving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Read(#[from] config::ConfigError),

    #[error("no home directory available for user configuration")]
    NoHomeDirectory,
}
