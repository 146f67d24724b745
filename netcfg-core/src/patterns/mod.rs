//! Shared patterns used across the allocator and storage layers

pub mod error_context;
pub mod retry;

pub use error_context::ErrorContext;
pub use retry::{retry, BackoffStrategy, JitterStrategy, RetryConfig};
