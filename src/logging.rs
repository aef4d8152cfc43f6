use std::str::FromStr;

use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Engine events at info, everything else (sqlx, tokio) at warn.
pub const DEFAULT_LOG_DIRECTIVES: &str = "warn,adaptive_engine=info";

const LOG_FILE_PREFIX: &str = "adaptive-engine.log";

/// Keeps the non-blocking file writer alive; dropping it flushes pending lines.
pub struct FileLogGuard {
    _guard: WorkerGuard,
}

pub fn file_logging_enabled() -> bool {
    std::env::var("ENABLE_FILE_LOGS")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}

/// A bare level (`debug`) applies to the engine's own targets only; anything
/// else is taken as a full directive list.
pub fn filter_directives(log_level: &str) -> String {
    let log_level = log_level.trim();
    if log_level.is_empty() {
        return DEFAULT_LOG_DIRECTIVES.to_string();
    }
    match LevelFilter::from_str(log_level) {
        Ok(level) => format!("warn,adaptive_engine={}", level.to_string().to_lowercase()),
        Err(_) => log_level.to_string(),
    }
}

fn engine_filter(log_level: &str) -> EnvFilter {
    let directives = filter_directives(log_level);
    EnvFilter::try_new(&directives).unwrap_or_else(|err| {
        eprintln!("invalid log directives {directives:?}: {err}");
        EnvFilter::new(DEFAULT_LOG_DIRECTIVES)
    })
}

pub fn init_tracing(log_level: &str) -> Option<FileLogGuard> {
    let env_filter = engine_filter(log_level);
    let stderr_layer = fmt::layer().with_target(true).with_writer(std::io::stderr);

    if file_logging_enabled() {
        let log_dir = std::env::var("LOG_DIR").unwrap_or_else(|_| "./logs".to_string());
        if let Err(err) = std::fs::create_dir_all(&log_dir) {
            eprintln!("failed to create log directory {log_dir}: {err}");
        } else {
            let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, LOG_FILE_PREFIX);
            let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
            let file_layer = fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_target(true);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .with(file_layer)
                .init();

            return Some(FileLogGuard { _guard: guard });
        }
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .init();

    None
}
