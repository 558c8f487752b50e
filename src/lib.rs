/* src/lib.rs */

// Re-export modules for both binary and tests
pub mod cli;
pub mod control;
pub mod error;
pub mod logger;
pub mod parse;
pub mod runtime;
pub mod shell;
pub mod signals;
pub mod socket;

// Fake spawner shared by unit and integration tests
#[doc(hidden)]
pub mod testing;

pub use control::{format_status, Supervisor};
pub use error::{CliError, ConfigError, LoggerError, SupervisorError};
pub use parse::{load_file, load_str, ExecMode, ProcessSpec};
pub use runtime::{
    Crash, ExitOutcome, OsSpawner, ProcessHandle, ProcessSnapshot, ProcessSpawner, ProcessState,
    SupervisedChild, SupervisorEvent,
};
