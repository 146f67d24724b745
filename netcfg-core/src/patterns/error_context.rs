//! Error context helpers for foreign error types
//!
//! Backend code converts third-party errors (redb, serde) into
//! [`NetcfgError`] while keeping the original error as the source.

use crate::error::{NetcfgError, NetcfgResult};

/// Trait for attaching operation context to foreign error results
pub trait ErrorContext<T> {
    /// Wrap the error as a storage failure for `operation`
    fn storage_context(self, operation: &str) -> NetcfgResult<T>;

    /// Wrap the error as a (de)serialization failure for `operation`
    fn serialization_context(self, operation: &str) -> NetcfgResult<T>;
}

impl<T, E> ErrorContext<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn storage_context(self, operation: &str) -> NetcfgResult<T> {
        self.map_err(|e| NetcfgError::storage(operation, e))
    }

    fn serialization_context(self, operation: &str) -> NetcfgResult<T> {
        self.map_err(|e| NetcfgError::serialization(operation, e))
    }
}
