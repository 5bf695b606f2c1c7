//! Integration tests for logging system

use bridge_traits::time::{LogLevel, LoggerSink};
use core_runtime::logging::{init_logging, redact_if_sensitive, LogFormat, LoggingConfig};
use core_runtime::Error;
use std::sync::Arc;

#[test]
fn test_logging_can_only_be_initialized_once() {
    let sink: Arc<dyn LoggerSink> = Arc::new(bridge_traits::time::ConsoleLogger {
        min_level: LogLevel::Warn,
    });
    let config = LoggingConfig::default()
        .with_format(LogFormat::Compact)
        .with_level(LogLevel::Debug)
        .with_logger_sink(sink);

    init_logging(config.clone()).expect("first initialization succeeds");
    tracing::warn!(target: "core_cache", key = "user:1", "persistence write failed");

    let second = init_logging(config);
    assert!(matches!(second, Err(Error::Logging(_))));
}

#[test]
fn test_key_material_is_redacted() {
    assert_eq!(
        redact_if_sensitive("encryption_key", "deadbeef"),
        "[REDACTED]"
    );
    assert_eq!(redact_if_sensitive("SECRET", "value"), "[REDACTED]");
    assert_eq!(redact_if_sensitive("query_key", "todos:1"), "todos:1");
}

#[test]
fn test_format_selection() {
    #[cfg(debug_assertions)]
    assert_eq!(LogFormat::default(), LogFormat::Pretty);

    #[cfg(not(debug_assertions))]
    assert_eq!(LogFormat::default(), LogFormat::Json);
}
