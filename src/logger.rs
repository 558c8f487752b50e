use crate::error::LoggerError;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::SubscriberBuilder;

/// Environment variable holding the log level (`error` .. `trace`).
pub const LOG_LEVEL_ENV: &str = "FORKVISOR_LOG";
pub const LOG_FILE: &str = "supervisor.log";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub directory: PathBuf,
    pub level: Level,
}

impl Default for LogSettings {
    fn default() -> Self {
        LogSettings {
            directory: PathBuf::from("logs"),
            level: Level::INFO,
        }
    }
}

impl LogSettings {
    /// Defaults, with the level taken from `FORKVISOR_LOG` when set.
    pub fn from_env(directory: Option<&Path>) -> Result<Self, LoggerError> {
        let mut settings = LogSettings::default();
        if let Some(dir) = directory {
            settings.directory = dir.to_path_buf();
        }
        if let Ok(raw) = std::env::var(LOG_LEVEL_ENV) {
            settings.level = parse_level(&raw)?;
        }
        Ok(settings)
    }
}

pub fn parse_level(raw: &str) -> Result<Level, LoggerError> {
    Level::from_str(raw.trim()).map_err(|_| LoggerError::Level(raw.to_string()))
}



/*
    @@@
    @logs_tracing();
    . Creates a daily-rotating log file (<dir>/supervisor.log) and wraps it in a non-blocking writer.
    . Configures a tracing subscriber at the configured level (with timestamps, levels and targets) on that writer.
    . Returns the guard; dropping it flushes and closes the appender.
*/
pub fn logs_tracing(settings: &LogSettings) -> Result<WorkerGuard, LoggerError> {
    std::fs::create_dir_all(&settings.directory).map_err(|source| LoggerError::Directory {
        path: settings.directory.clone(),
        source,
    })?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &settings.directory, LOG_FILE);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let subscriber = SubscriberBuilder::default()
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_writer(non_blocking)
        .with_max_level(settings.level)
        .finish();

    tracing::subscriber::set_global_default(subscriber).map_err(|_| LoggerError::AlreadyInstalled)?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_levels_case_insensitively() {
        assert_eq!(parse_level("debug").unwrap(), Level::DEBUG);
        assert_eq!(parse_level(" WARN ").unwrap(), Level::WARN);
        assert!(matches!(parse_level("loud"), Err(LoggerError::Level(_))));
    }

    #[test]
    fn default_settings_log_info_to_logs_dir() {
        let settings = LogSettings::default();
        assert_eq!(settings.directory, PathBuf::from("logs"));
        assert_eq!(settings.level, Level::INFO);
    }
}
