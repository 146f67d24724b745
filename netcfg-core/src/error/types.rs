//! Core error types for netcfg

use thiserror::Error;

/// Error type shared by allocators, stores and the mutation pipeline.
#[derive(Error, Debug)]
pub enum NetcfgError {
    // Configuration
    #[error("Configuration error in {component}: {message}")]
    ConfigurationError { component: String, message: String },

    // Request rejections
    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Resource not found: {resource}")]
    NotFound { resource: String },

    #[error("Already exists: {resource}")]
    AlreadyExists { resource: String },

    #[error("Conflict on {resource}: {reason}")]
    Conflict { resource: String, reason: String },

    #[error("Invalid operation '{operation}': {reason}")]
    InvalidOperation { operation: String, reason: String },

    // Scarcity
    #[error("Resource exhausted: {resource}")]
    ResourceExhausted { resource: String },

    #[error("Subnet(s) in network {network} exhausted, tried: {}", .tried.join(", "))]
    SubnetExhausted { network: String, tried: Vec<String> },

    // Transient infrastructure failures
    #[error("Temporary failure: {details}")]
    TemporaryFailure { details: String },

    #[error("Coordination session expired: {details}")]
    SessionExpired { details: String },

    #[error("Operation timed out: {operation} after {duration:?}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    // Infrastructure
    #[error("Storage operation '{operation}' failed")]
    Storage {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Serialization operation '{operation}' failed")]
    Serialization {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("JSON error: {0}")]
    JsonError(#[from] Box<serde_json::Error>),

    #[error("IO error: {0}")]
    IoError(#[from] Box<std::io::Error>),

    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("Multiple errors in {context}: {}", format_errors(.errors))]
    Multiple {
        context: String,
        errors: Vec<NetcfgError>,
    },
}

pub fn format_errors(errors: &[NetcfgError]) -> String {
    errors
        .iter()
        .enumerate()
        .map(|(i, e)| format!("{}. {}", i + 1, e))
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, NetcfgError>;
pub type NetcfgResult<T> = std::result::Result<T, NetcfgError>;
