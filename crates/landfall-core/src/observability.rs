//! Observability infrastructure for Landfall.
//!
//! Structured logging with consistent spans. This module provides the
//! initialization helper and the span constructors used by the engine so that
//! every log line for one notification carries the same bucket and key.

use std::str::FromStr;
use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::Error;

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    #[default]
    Json,
    /// Pretty-printed logs (for development).
    Pretty,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(Error::InvalidInput(format!(
                "log format must be one of: json, pretty (got {other})"
            ))),
        }
    }
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `landfall_ingest=debug`)
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates the span that wraps the handling of one notification.
#[must_use]
pub fn ingest_span(bucket: &str, key: &str) -> Span {
    tracing::info_span!("ingest", bucket = bucket, key = key)
}

/// Creates the span for one subscriber run over a table's backlog.
#[must_use]
pub fn subscriber_span(bucket: &str, table_prefix: &str) -> Span {
    tracing::info_span!(
        "subscriber",
        bucket = bucket,
        table_prefix = table_prefix,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_succeeds() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Pretty);
    }

    #[test]
    fn test_log_format_parse() {
        assert_eq!("JSON".parse::<LogFormat>().expect("json"), LogFormat::Json);
        assert_eq!(
            "pretty".parse::<LogFormat>().expect("pretty"),
            LogFormat::Pretty
        );
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_span_helpers_create_spans() {
        let span = ingest_span("b", "d/t/_SUCCESS");
        let _guard = span.enter();
        tracing::info!("message in ingest span");

        let span = subscriber_span("b", "d/t");
        let _guard = span.enter();
        tracing::info!("message in subscriber span");
    }
}
