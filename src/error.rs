use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading a process configuration. Loading is
/// all-or-nothing: any of these aborts before a single process starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("duplicate process name `{name}`")]
    DuplicateName { name: String },

    #[error("invalid field `{field}` in entry `{entry}`: {reason}")]
    InvalidField {
        entry: String,
        field: &'static str,
        reason: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(entry: &str, field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidField {
            entry: entry.to_string(),
            field,
            reason: reason.into(),
        }
    }
}

/// Errors surfaced by supervisor operations. None of them is fatal to
/// the supervisor itself.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("no such program: `{0}`")]
    NotFound(String),

    #[error("program `{0}` is already running")]
    AlreadyRunning(String),

    #[error("program `{0}` appears more than once in the same start request")]
    DuplicateName(String),
}

/// Command line and shell input errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CliError {
    #[error("usage: {0}")]
    Usage(String),

    #[error("unknown command: `{0}` (try `help`)")]
    UnknownCommand(String),
}

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("cannot create log directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown log level `{0}`")]
    Level(String),

    #[error("a global tracing subscriber is already installed")]
    AlreadyInstalled,
}
