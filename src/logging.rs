//! Diagnostic logging setup.

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use crate::config::LoggingSettings;

pub const LOG_FILE_PREFIX: &str = "marketplace.log";

/// `RUST_LOG` wins over the configured filter when it is set.
pub fn effective_filter(settings: &LoggingSettings, rust_log: Option<String>) -> String {
    rust_log
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| settings.filter.clone())
}

/// Install the global subscriber: stderr in text or JSON, plus an optional
/// daily-rolling file. The returned guard must live until exit so buffered
/// file output is flushed.
pub fn init(settings: &LoggingSettings) -> Result<Option<WorkerGuard>> {
    let directive = effective_filter(settings, std::env::var("RUST_LOG").ok());
    let filter = EnvFilter::try_new(&directive)
        .with_context(|| format!("Invalid log filter '{}'", directive))?;

    let (file_layer, guard) = match &settings.dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);
    let installed = if settings.json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
    };
    installed.context("Failed to install tracing subscriber")?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(filter: &str) -> LoggingSettings {
        LoggingSettings {
            filter: filter.to_string(),
            json: false,
            dir: None,
        }
    }

    #[test]
    fn test_rust_log_overrides_configured_filter() {
        let s = settings("info");
        assert_eq!(effective_filter(&s, None), "info");
        assert_eq!(effective_filter(&s, Some("  ".into())), "info");
        assert_eq!(
            effective_filter(&s, Some("marketplace=trace".into())),
            "marketplace=trace"
        );
    }

    #[test]
    fn test_configured_filters_parse() {
        for directive in ["info", "debug", "warn,marketplace::deploy=debug"] {
            assert!(EnvFilter::try_new(directive).is_ok(), "{}", directive);
        }
    }
}
