//! Logging setup and span helpers

use crate::config::LoggingConfig;
use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};
use uuid::Uuid;

/// Initialize tracing from the logging section of the configuration
///
/// `RUST_LOG` takes precedence over the configured level. Calling this more
/// than once (as tests do) keeps the first subscriber.
pub fn init_tracing(config: &LoggingConfig) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "netcfg_core={level},netcfg={level},redb=warn",
            level = config.level
        ))
    });

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(config.with_thread_ids)
        .with_file(config.with_file_location)
        .with_line_number(config.with_file_location);

    let _ = Registry::default()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();
}

/// Span for one mutation request flowing through the pipeline
#[inline]
pub fn mutation_span(operation: &str, resource_type: &str, request_id: Uuid) -> Span {
    tracing::info_span!(
        "mutation",
        operation = %operation,
        resource_type = %resource_type,
        request_id = %request_id,
        state = tracing::field::Empty,
    )
}

/// Span for an allocator operation against one coordination path
#[inline]
pub fn allocator_span(operation: &str, path: &str) -> Span {
    tracing::debug_span!(
        "allocator",
        operation = %operation,
        path = %path,
        index = tracing::field::Empty,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[traced_test]
    #[test]
    fn test_mutation_span_fields() {
        let request_id = Uuid::new_v4();
        let span = mutation_span("create", "tag", request_id);
        let _guard = span.enter();
        tracing::info!("inside mutation");

        assert!(logs_contain("inside mutation"));
        assert!(logs_contain("resource_type=tag"));
    }

    #[test]
    fn test_init_tracing_twice_is_harmless() {
        let config = LoggingConfig::default();
        init_tracing(&config);
        init_tracing(&config);
    }
}
