use nix::sys::signal::Signal;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// A single value or a list of them, e.g. `args: "-a -b"` or `args: ["-a", "-b"]`.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

/// How an instance is executed. Only forked, detached processes are
/// supported; cluster mode is reserved and rejected at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecMode {
    #[default]
    Fork,
}

pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_millis(1600);

/// Upper bound on `instances` for a single program.
pub const MAX_INSTANCES: usize = 1024;

/// Immutable, validated description of one supervised program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub name: String,
    pub executable: String,
    pub arguments: Vec<String>,
    pub mode: ExecMode,
    pub instance_count: usize,
    pub restart_delay: Duration,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub out_file: Option<PathBuf>,
    pub error_file: Option<PathBuf>,
    pub kill_timeout: Duration,
    pub stop_signal: Signal,
}

impl ProcessSpec {
    /// Spec with defaults for everything but the name and command line.
    pub fn new(name: impl Into<String>, executable: impl Into<String>, arguments: Vec<String>) -> Self {
        ProcessSpec {
            name: name.into(),
            executable: executable.into(),
            arguments,
            mode: ExecMode::Fork,
            instance_count: 1,
            restart_delay: Duration::ZERO,
            cwd: None,
            env: BTreeMap::new(),
            out_file: None,
            error_file: None,
            kill_timeout: DEFAULT_KILL_TIMEOUT,
            stop_signal: Signal::SIGTERM,
        }
    }

    pub fn with_instances(mut self, count: usize) -> Self {
        self.instance_count = count;
        self
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    pub fn with_kill_timeout(mut self, timeout: Duration) -> Self {
        self.kill_timeout = timeout;
        self
    }

    /// The command line as it would be typed in a shell.
    pub fn command_line(&self) -> String {
        std::iter::once(self.executable.as_str())
            .chain(self.arguments.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}
