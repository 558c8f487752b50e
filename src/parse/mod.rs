//! Declarative process configuration: the typed `ProcessSpec` and the
//! loader that produces validated specs from YAML or JSON.

#[allow(clippy::module_inception)]
mod parse;
mod spec;

pub use parse::{load_file, load_str, parse_signal};
pub use spec::{ExecMode, OneOrMany, ProcessSpec, DEFAULT_KILL_TIMEOUT, MAX_INSTANCES};
