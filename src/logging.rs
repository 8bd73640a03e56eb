//! Process-wide `tracing` subscriber setup
//!
//! Log level precedence: an explicit override (the `--log-level` flag), then
//! `RUST_LOG`, then `logging.level` from the configuration. Console output is
//! text or JSON; with `logging.directory` set, the same events also go to a
//! daily rolling file through a non-blocking writer.

use crate::config::{LogFormat, LoggingSettings};
use crate::error::{RadapterError, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Build the level filter
pub fn filter(settings: &LoggingSettings, level_override: Option<&str>) -> Result<EnvFilter> {
    let directives = match level_override {
        Some(level) => level.to_string(),
        None => match std::env::var(EnvFilter::DEFAULT_ENV) {
            Ok(env) if !env.trim().is_empty() => env,
            _ => settings.level.clone(),
        },
    };
    EnvFilter::try_new(&directives)
        .map_err(|e| RadapterError::Config(format!("invalid log level '{}': {}", directives, e)))
}

fn console_layer(format: LogFormat) -> BoxedLayer {
    match format {
        LogFormat::Text => fmt::layer().with_target(true).boxed(),
        LogFormat::Json => fmt::layer().json().boxed(),
    }
}

/// Install the global subscriber
///
/// The returned guard flushes the log file when dropped; keep it alive for
/// the life of the process.
pub fn init(
    settings: &LoggingSettings,
    level_override: Option<&str>,
) -> Result<Option<WorkerGuard>> {
    let filter = filter(settings, level_override)?;
    let mut layers: Vec<BoxedLayer> = vec![console_layer(settings.format)];

    let guard = match &settings.directory {
        Some(directory) => {
            std::fs::create_dir_all(directory)?;
            let appender = tracing_appender::rolling::daily(directory, &settings.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = match settings.format {
                LogFormat::Text => fmt::layer().with_ansi(false).with_writer(writer).boxed(),
                LogFormat::Json => fmt::layer().json().with_writer(writer).boxed(),
            };
            layers.push(file_layer);
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| RadapterError::Config(format!("logging already initialized: {}", e)))?;

    if let Some(directory) = &settings.directory {
        tracing::info!("Logging to {}", directory.display());
    }
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_wins() {
        let settings = LoggingSettings {
            level: "warn".to_string(),
            ..LoggingSettings::default()
        };
        let filter = filter(&settings, Some("debug")).unwrap();
        assert_eq!(filter.to_string(), "debug");
    }

    #[test]
    fn test_directives_accepted() {
        let settings = LoggingSettings {
            level: "info,radapter::transport=trace".to_string(),
            ..LoggingSettings::default()
        };
        assert!(filter(&settings, Some(&settings.level)).is_ok());
    }
}
