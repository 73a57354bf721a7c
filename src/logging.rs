//! Structured logging setup.
//!
//! `RUST_LOG` wins over the configured level; the configured level is used as
//! the default directive otherwise.

use crate::config::LogConfig;
use crate::errors::{DaemonError, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber.
///
/// Returns the appender guard when file output is enabled; dropping it stops
/// the background writer, so callers hold it for the process lifetime.
pub fn init_logging(config: &LogConfig) -> Result<Option<WorkerGuard>> {
    let filter = build_env_filter(config)?;
    let json = config.format.eq_ignore_ascii_case("json");

    let (file_layer, guard) = match &config.file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| std::path::PathBuf::from("."));
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "printfleet.log".to_string());

            std::fs::create_dir_all(&dir).map_err(|e| {
                DaemonError::Config(format!("Failed to create log directory {:?}: {}", dir, e))
            })?;

            let appender = tracing_appender::rolling::daily(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);

    let init_result = if json {
        registry
            .with(fmt::layer().json().with_target(true))
            .try_init()
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false),
            )
            .try_init()
    };

    init_result.map_err(|e| DaemonError::Config(format!("Failed to install logger: {}", e)))?;
    Ok(guard)
}

fn build_env_filter(config: &LogConfig) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.level)
        .map_err(|e| DaemonError::Config(format!("Invalid log level '{}': {}", config.level, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_level_accepted() {
        assert!(build_env_filter(&LogConfig::default()).is_ok());
    }

    #[test]
    fn test_module_directives_accepted() {
        let config = LogConfig {
            level: "info,printfleet::polling=debug".to_string(),
            ..LogConfig::default()
        };
        assert!(build_env_filter(&config).is_ok());
    }
}
