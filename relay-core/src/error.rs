#![forbid(unsafe_code)]

//! Common error type for relay crates.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    /// I/O related failures.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration parsing failures.
    #[error("Config parse error: {0}")]
    ConfigParse(toml::de::Error),

    /// Filesystem watch errors.
    #[error("Notify error: {0}")]
    Notify(#[from] notify::Error),

    /// Configuration parsed but holds values the gateway cannot run with.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Convenient alias for results throughout relay crates.
pub type RelayResult<T> = Result<T, RelayError>;
