//! Error types for relcache
//!
//! This module defines the error types used throughout the crate.

use thiserror::Error;

/// Result type alias for relcache
pub type Result<T> = std::result::Result<T, RelcacheError>;

/// Main error type for relcache
#[derive(Error, Debug)]
pub enum RelcacheError {
    /// Internal consistency violations. The cache or the connection registry
    /// no longer matches the warehouse and must not be used further.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Misuse of the runtime, e.g. a thread asking for a connection it never acquired
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// A statement failed on the warehouse
    #[error("Database error: {0}")]
    Database(String),

    /// Opening a connection failed
    #[error("Failed to connect: {0}")]
    FailedToConnect(String),

    /// The backend does not support the requested operation
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Raw driver errors
    #[error("Driver error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// IO-related errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing errors
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// TOML serialization errors
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// Unknown backend name
    #[error("Unsupported database type: {0}")]
    UnsupportedDatabaseType(String),

    /// Command is missing arguments
    #[error("Invalid syntax for {command}, expected: {expected}")]
    InvalidCommandSyntax { command: String, expected: String },

    /// Unknown command
    #[error("Unknown command: {0}")]
    UnknownCommand(String),
}

impl RelcacheError {
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Internal error raised when the relation cache detects it has lost
    /// track of the warehouse.
    pub fn cache_inconsistent(msg: impl std::fmt::Display) -> Self {
        Self::Internal(format!("Cache inconsistency detected: {}", msg))
    }

    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::Runtime(msg.into())
    }

    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    pub fn failed_to_connect(msg: impl Into<String>) -> Self {
        Self::FailedToConnect(msg.into())
    }

    pub fn not_supported(msg: impl Into<String>) -> Self {
        Self::NotSupported(msg.into())
    }

    /// True for errors that mean internal state has diverged from reality
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Internal(_))
    }

    /// Translate a raw driver error into the domain taxonomy.
    ///
    /// Domain errors pass through untouched; sqlx errors become
    /// [`RelcacheError::Database`] with the driver message trimmed.
    pub fn into_database_error(self) -> Self {
        match self {
            Self::Sqlx(err) => Self::Database(err.to_string().trim().to_string()),
            other => other,
        }
    }
}
