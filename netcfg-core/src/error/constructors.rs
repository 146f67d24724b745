//! Constructor methods and classification helpers for NetcfgError

use super::types::NetcfgError;

impl NetcfgError {
    /// Create a configuration error with component and message
    ///
    /// # Examples
    /// ```rust
    /// use netcfg_core::error::NetcfgError;
    ///
    /// let err = NetcfgError::configuration("allocator.max_conflict_retries", "must be positive");
    /// ```
    pub fn configuration(component: impl Into<String>, message: impl Into<String>) -> Self {
        NetcfgError::ConfigurationError {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Create a validation error for a rejected field
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        NetcfgError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        NetcfgError::NotFound {
            resource: resource.into(),
        }
    }

    pub fn already_exists(resource: impl Into<String>) -> Self {
        NetcfgError::AlreadyExists {
            resource: resource.into(),
        }
    }

    pub fn conflict(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        NetcfgError::Conflict {
            resource: resource.into(),
            reason: reason.into(),
        }
    }

    pub fn exhausted(resource: impl Into<String>) -> Self {
        NetcfgError::ResourceExhausted {
            resource: resource.into(),
        }
    }

    pub fn temporary(details: impl Into<String>) -> Self {
        NetcfgError::TemporaryFailure {
            details: details.into(),
        }
    }

    pub fn session_expired(details: impl Into<String>) -> Self {
        NetcfgError::SessionExpired {
            details: details.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        NetcfgError::Internal {
            message: message.into(),
        }
    }

    /// Create a Storage error with a boxed source
    pub fn storage<E: std::error::Error + Send + Sync + 'static>(
        operation: impl Into<String>,
        source: E,
    ) -> Self {
        NetcfgError::Storage {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    /// Create a Serialization error with a boxed source
    pub fn serialization<E: std::error::Error + Send + Sync + 'static>(
        operation: impl Into<String>,
        source: E,
    ) -> Self {
        NetcfgError::Serialization {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    /// Create an invalid configuration error with detailed context
    pub fn invalid_config<T: std::fmt::Display>(field: &str, value: T, reason: &str) -> Self {
        NetcfgError::ConfigurationError {
            component: field.to_string(),
            message: format!("Invalid value '{}': {}", value, reason),
        }
    }

    /// Errors that a coordination or store client should retry after
    /// re-establishing its session.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NetcfgError::TemporaryFailure { .. }
                | NetcfgError::SessionExpired { .. }
                | NetcfgError::Timeout { .. }
        )
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, NetcfgError::AlreadyExists { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, NetcfgError::NotFound { .. })
    }
}
