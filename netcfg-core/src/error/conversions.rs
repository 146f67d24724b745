//! Error conversion implementations for NetcfgError

use super::types::NetcfgError;

// Storage error conversions
impl From<redb::TransactionError> for NetcfgError {
    fn from(err: redb::TransactionError) -> Self {
        NetcfgError::storage("transaction", err)
    }
}

impl From<redb::TableError> for NetcfgError {
    fn from(err: redb::TableError) -> Self {
        NetcfgError::storage("open_table", err)
    }
}

impl From<redb::StorageError> for NetcfgError {
    fn from(err: redb::StorageError) -> Self {
        NetcfgError::storage("storage_operation", err)
    }
}

impl From<redb::DatabaseError> for NetcfgError {
    fn from(err: redb::DatabaseError) -> Self {
        NetcfgError::storage("open_database", err)
    }
}

impl From<redb::CommitError> for NetcfgError {
    fn from(err: redb::CommitError) -> Self {
        NetcfgError::storage("commit", err)
    }
}

// Serialization error conversions
impl From<serde_json::Error> for NetcfgError {
    fn from(err: serde_json::Error) -> Self {
        NetcfgError::JsonError(Box::new(err))
    }
}

impl From<toml::de::Error> for NetcfgError {
    fn from(err: toml::de::Error) -> Self {
        NetcfgError::configuration("toml", err.to_string())
    }
}

// System error conversions
impl From<std::io::Error> for NetcfgError {
    fn from(err: std::io::Error) -> Self {
        NetcfgError::IoError(Box::new(err))
    }
}

impl From<std::num::ParseIntError> for NetcfgError {
    fn from(err: std::num::ParseIntError) -> Self {
        NetcfgError::validation("numeric_value", format!("Invalid numeric value: {}", err))
    }
}

impl From<std::net::AddrParseError> for NetcfgError {
    fn from(err: std::net::AddrParseError) -> Self {
        NetcfgError::validation("ip_address", format!("Invalid address: {}", err))
    }
}

impl From<ipnet::AddrParseError> for NetcfgError {
    fn from(err: ipnet::AddrParseError) -> Self {
        NetcfgError::validation("ip_prefix", format!("Invalid prefix: {}", err))
    }
}

impl From<uuid::Error> for NetcfgError {
    fn from(err: uuid::Error) -> Self {
        NetcfgError::validation("uuid", format!("Invalid UUID: {}", err))
    }
}

// Async/Task error conversions
impl From<tokio::task::JoinError> for NetcfgError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            NetcfgError::Internal {
                message: "Task was cancelled".to_string(),
            }
        } else if err.is_panic() {
            NetcfgError::Internal {
                message: "Task panicked".to_string(),
            }
        } else {
            NetcfgError::Internal {
                message: format!("Task join failed: {}", err),
            }
        }
    }
}

impl From<tokio::time::error::Elapsed> for NetcfgError {
    fn from(_err: tokio::time::error::Elapsed) -> Self {
        NetcfgError::Timeout {
            operation: "async_operation".to_string(),
            duration: std::time::Duration::from_secs(0),
        }
    }
}

impl From<redb::Error> for NetcfgError {
    fn from(err: redb::Error) -> Self {
        NetcfgError::storage("redb", err)
    }
}
