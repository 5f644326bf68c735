//! Error types for the bridge
//!
//! Crate-level errors. Subsystems that hand errors to the script runtime
//! (HTTP, resources, encoding) keep their own enums next to their code.

use thiserror::Error;

/// Errors that can occur while building or driving a bridge
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Bundled resource errors (missing or unreadable files)
    #[error("Resource error: {0}")]
    Resource(String),

    /// Runtime thread or script engine errors
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Host platform errors
    #[error("Host error: {0}")]
    Host(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing errors
    #[error("Config parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
}

/// Result type alias for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;
