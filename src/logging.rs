//! Tracing subscriber setup (§4.16, §6b). Console output is always on;
//! a file sink via `tracing-appender` is added when `logging.file` is
//! set. An unrecognized `logging.level` falls back to INFO with a
//! warning rather than failing startup.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use crate::config::LoggingConfig;

fn parse_level(level: &str) -> Option<LevelFilter> {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Some(LevelFilter::TRACE),
        "debug" => Some(LevelFilter::DEBUG),
        "info" => Some(LevelFilter::INFO),
        "warn" | "warning" => Some(LevelFilter::WARN),
        "error" => Some(LevelFilter::ERROR),
        _ => None,
    }
}

/// Returned to the caller so the non-blocking file writer's background
/// thread stays alive for the process lifetime; dropping it silently
/// stops log delivery.
pub struct LoggingHandle {
    _file_guard: Option<WorkerGuard>,
}

pub fn init(cfg: &LoggingConfig) -> LoggingHandle {
    let (level, fallback_warning) = match parse_level(&cfg.level) {
        Some(level) => (level, None),
        None => (
            LevelFilter::INFO,
            Some(format!(
                "unrecognized logging.level {:?}, falling back to info",
                cfg.level
            )),
        ),
    };

    let console_layer = fmt::layer().with_target(false);

    let (file_layer, guard) = match &cfg.file {
        Some(path) => {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    let _ = std::fs::create_dir_all(parent);
                }
            }
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "keymesh.log".to_string());
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
            let appender = match dir {
                Some(dir) => tracing_appender::rolling::never(dir, &file_name),
                None => tracing_appender::rolling::never(".", &file_name),
            };
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_target(false).with_writer(non_blocking);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(level)
        .with(console_layer)
        .with(file_layer)
        .init();

    if let Some(msg) = fallback_warning {
        tracing::warn!("{msg}");
    }

    LoggingHandle { _file_guard: guard }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_standard_level_names() {
        assert_eq!(parse_level("INFO"), Some(LevelFilter::INFO));
        assert_eq!(parse_level("warn"), Some(LevelFilter::WARN));
        assert_eq!(parse_level("warning"), Some(LevelFilter::WARN));
        assert_eq!(parse_level("bogus"), None);
    }
}
