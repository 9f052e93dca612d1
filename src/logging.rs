//! Process-wide tracing setup.
//!
//! Library code only emits `tracing` events; binaries call [`init_logging`]
//! once at startup.

use crate::config::LoggingConfig;
use crate::error::{Result, ScopeError};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Parse an `EnvFilter` directive such as `"info,scopeflow=debug"`.
pub fn parse_filter(directive: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(directive)
        .map_err(|e| ScopeError::Config(format!("Invalid log filter '{}': {}", directive, e)))
}

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over the configured filter. When a log
/// directory is configured, events are also written to a daily rolling file;
/// keep the returned guard alive until exit so buffered lines are flushed.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => parse_filter(&config.filter)?,
    };

    let (file_layer, guard) = match &config.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, &config.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_ansi(config.ansi))
        .with(file_layer)
        .try_init()
        .map_err(|e| ScopeError::Config(format!("Failed to install logger: {}", e)))?;

    if let Some(dir) = &config.directory {
        tracing::info!("Logging to {:?}", dir);
    }
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_LOG_FILTER;

    #[test]
    fn test_default_filter_parses() {
        assert!(parse_filter(DEFAULT_LOG_FILTER).is_ok());
    }

    #[test]
    fn test_bad_filter_rejected() {
        let err = parse_filter("scopeflow=loudest").unwrap_err();
        assert!(err.to_string().contains("scopeflow=loudest"));
    }
}
