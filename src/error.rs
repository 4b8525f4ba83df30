//! # Error Types
//!
//! Structured error handling for the bus core using thiserror. Every fallible
//! operation in the crate returns [`OrchBusResult`].

use thiserror::Error;

/// Errors raised by the store backends, channels, multiplexer and loop.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OrchBusError {
    #[error("Store error: {operation}: {message}")]
    Store { operation: String, message: String },

    #[error("Atomic script {script} failed: {message}")]
    ScriptFailed { script: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Payload too large: {size_bytes} bytes exceeds limit of {limit_bytes} bytes")]
    PayloadTooLarge {
        size_bytes: usize,
        limit_bytes: usize,
    },

    #[error("Notification transport closed for {source_name}")]
    TransportClosed { source_name: String },

    #[error("Invalid channel pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl OrchBusError {
    /// Create a store operation error
    pub fn store(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Store {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create an atomic script failure
    pub fn script_failed(script: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ScriptFailed {
            script: script.into(),
            message: message.into(),
        }
    }

    /// Create a transport-closed error
    pub fn transport_closed(source_name: impl Into<String>) -> Self {
        Self::TransportClosed {
            source_name: source_name.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Whether the failure came from the store rather than from local parsing.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, Self::Store { .. } | Self::ScriptFailed { .. })
    }
}

impl From<sqlx::Error> for OrchBusError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => OrchBusError::store("pool", "connection pool timed out"),
            sqlx::Error::PoolClosed => OrchBusError::store("pool", "connection pool is closed"),
            sqlx::Error::Database(db_err) => OrchBusError::store("query", db_err.to_string()),
            other => OrchBusError::store("connection", other.to_string()),
        }
    }
}

impl From<serde_json::Error> for OrchBusError {
    fn from(err: serde_json::Error) -> Self {
        OrchBusError::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for OrchBusError {
    fn from(err: config::ConfigError) -> Self {
        OrchBusError::Configuration(err.to_string())
    }
}

impl From<regex::Error> for OrchBusError {
    fn from(err: regex::Error) -> Self {
        OrchBusError::InvalidPattern {
            pattern: String::new(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for bus operations
pub type OrchBusResult<T> = Result<T, OrchBusError>;
