use crate::error::CliError;
use std::path::PathBuf;

pub const USAGE: &str = "\
forkvisor start <config> [--no-shell] [--log-dir <dir>]   launch every program in <config>
forkvisor check <config>                                  validate <config> and print the programs
forkvisor status [name] [--log-dir <dir>]                 ask a running supervisor for instance states
forkvisor stop <name> [--log-dir <dir>]                   ask a running supervisor to stop a program
forkvisor stop-all [--log-dir <dir>]                      ask a running supervisor to stop every program

shell commands:
  status [name]    show instance states, pids and restart counts
  stop <name>      stop every instance of a program
  stop-all         stop every program
  help             show this text
  exit             stop everything and leave";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start {
        config: PathBuf,
        shell: bool,
        log_dir: Option<PathBuf>,
    },
    Check {
        config: PathBuf,
    },
    Stop {
        name: String,
    },
    StopAll,
    Status {
        name: Option<String>,
    },
    Help,
    Exit,
    /// A shell command line to send to the supervisor running under `log_dir`.
    Remote {
        line: String,
        log_dir: Option<PathBuf>,
    },
}

/// Parses the process arguments, program name excluded.
pub fn parse_args<I, S>(args: I) -> Result<Command, CliError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let words: Vec<String> = args.into_iter().map(Into::into).collect();
    if words.is_empty() {
        return Ok(Command::Help);
    }
    if matches!(words[0].as_str(), "stop" | "stop-all" | "status") {
        return parse_remote(&words);
    }
    match parse_words(&words)? {
        Command::Exit => Err(CliError::UnknownCommand("exit".into())),
        other => Ok(other),
    }
}

/// `--log-dir` may appear anywhere; the remaining words must form a valid
/// shell command, which is forwarded verbatim.
fn parse_remote(words: &[String]) -> Result<Command, CliError> {
    let mut log_dir = None;
    let mut rest = Vec::with_capacity(words.len());
    let mut iter = words.iter();
    while let Some(word) = iter.next() {
        if word == "--log-dir" {
            let dir = iter
                .next()
                .ok_or_else(|| CliError::Usage(format!("{} ... --log-dir <dir>", words[0])))?;
            log_dir = Some(PathBuf::from(dir));
        } else {
            rest.push(word.clone());
        }
    }
    parse_words(&rest)?;
    Ok(Command::Remote {
        line: rest.join(" "),
        log_dir,
    })
}

/// Parses one line typed into the shell. Blank lines yield `None`.
pub fn parse_shell_line(line: &str) -> Result<Option<Command>, CliError> {
    let words: Vec<String> = line.split_whitespace().map(String::from).collect();
    if words.is_empty() {
        return Ok(None);
    }
    match parse_words(&words)? {
        Command::Start { .. } | Command::Check { .. } => {
            Err(CliError::Usage(format!("`{}` is only available on the command line", words[0])))
        }
        other => Ok(Some(other)),
    }
}

fn parse_words(words: &[String]) -> Result<Command, CliError> {
    let (verb, rest) = match words.split_first() {
        Some((verb, rest)) => (verb.as_str(), rest),
        None => return Ok(Command::Help),
    };

    match verb {
        "start" => parse_start(rest),
        "check" => match rest {
            [config] => Ok(Command::Check { config: PathBuf::from(config) }),
            _ => Err(CliError::Usage("check <config>".into())),
        },
        "stop" => match rest {
            [name] => Ok(Command::Stop { name: name.clone() }),
            _ => Err(CliError::Usage("stop <name>".into())),
        },
        "stop-all" if rest.is_empty() => Ok(Command::StopAll),
        "stop-all" => Err(CliError::Usage("stop-all".into())),
        "status" => match rest {
            [] => Ok(Command::Status { name: None }),
            [name] => Ok(Command::Status { name: Some(name.clone()) }),
            _ => Err(CliError::Usage("status [name]".into())),
        },
        "help" | "--help" | "-h" => Ok(Command::Help),
        "exit" | "quit" => Ok(Command::Exit),
        other => Err(CliError::UnknownCommand(other.to_string())),
    }
}

fn parse_start(rest: &[String]) -> Result<Command, CliError> {
    let usage = || CliError::Usage("start <config> [--no-shell] [--log-dir <dir>]".into());
    let mut config = None;
    let mut shell = true;
    let mut log_dir = None;

    let mut iter = rest.iter();
    while let Some(word) = iter.next() {
        match word.as_str() {
            "--no-shell" => shell = false,
            "--log-dir" => log_dir = Some(PathBuf::from(iter.next().ok_or_else(usage)?)),
            flag if flag.starts_with("--") => return Err(usage()),
            path if config.is_none() => config = Some(PathBuf::from(path)),
            _ => return Err(usage()),
        }
    }

    Ok(Command::Start {
        config: config.ok_or_else(usage)?,
        shell,
        log_dir,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_with_flags() {
        let cmd = parse_args(["start", "apps.yml", "--no-shell", "--log-dir", "/tmp/fv"]).unwrap();
        assert_eq!(
            cmd,
            Command::Start {
                config: PathBuf::from("apps.yml"),
                shell: false,
                log_dir: Some(PathBuf::from("/tmp/fv")),
            }
        );
    }

    #[test]
    fn start_requires_a_config() {
        assert!(matches!(parse_args(["start"]), Err(CliError::Usage(_))));
        assert!(matches!(parse_args(["start", "a.yml", "b.yml"]), Err(CliError::Usage(_))));
        assert!(matches!(parse_args(["start", "a.yml", "--log-dir"]), Err(CliError::Usage(_))));
        assert!(matches!(parse_args(["start", "a.yml", "--verbose"]), Err(CliError::Usage(_))));
    }

    #[test]
    fn runtime_commands_go_to_the_running_supervisor() {
        assert_eq!(
            parse_args(["stop", "x"]),
            Ok(Command::Remote { line: "stop x".into(), log_dir: None })
        );
        assert_eq!(
            parse_args(["status", "--log-dir", "/tmp/fv"]),
            Ok(Command::Remote { line: "status".into(), log_dir: Some(PathBuf::from("/tmp/fv")) })
        );
        assert_eq!(
            parse_args(["stop-all", "--log-dir", "run"]),
            Ok(Command::Remote { line: "stop-all".into(), log_dir: Some(PathBuf::from("run")) })
        );
        assert!(matches!(parse_args(["stop"]), Err(CliError::Usage(_))));
        assert!(matches!(parse_args(["status", "a", "b"]), Err(CliError::Usage(_))));
        assert!(matches!(parse_args(["stop", "x", "--log-dir"]), Err(CliError::Usage(_))));
        assert_eq!(parse_args(["exit"]), Err(CliError::UnknownCommand("exit".into())));
    }

    #[test]
    fn no_arguments_means_help() {
        assert_eq!(parse_args(Vec::<String>::new()), Ok(Command::Help));
    }

    #[test]
    fn shell_lines() {
        assert_eq!(parse_shell_line("   "), Ok(None));
        assert_eq!(parse_shell_line("status"), Ok(Some(Command::Status { name: None })));
        assert_eq!(
            parse_shell_line("status fullnode_pair_reserve"),
            Ok(Some(Command::Status { name: Some("fullnode_pair_reserve".into()) }))
        );
        assert_eq!(parse_shell_line(" stop  a "), Ok(Some(Command::Stop { name: "a".into() })));
        assert_eq!(parse_shell_line("stop-all"), Ok(Some(Command::StopAll)));
        assert_eq!(parse_shell_line("quit"), Ok(Some(Command::Exit)));
        assert!(matches!(parse_shell_line("stop"), Err(CliError::Usage(_))));
        assert!(matches!(parse_shell_line("start x.yml"), Err(CliError::Usage(_))));
        assert_eq!(parse_shell_line("reload"), Err(CliError::UnknownCommand("reload".into())));
    }
}
