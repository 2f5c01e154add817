//! Core error types

use thiserror::Error;

/// Core error type for SecureMesh
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration file could not be parsed
    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;
