use crate::cli::{parse_shell_line, Command};
use crate::error::SupervisorError;
use nix::sys::termios::{tcgetattr, tcsetattr, SetArg, Termios};
use rustyline::completion::{Completer, Pair};
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::history::DefaultHistory;
use rustyline::validate::Validator;
use rustyline::{error::ReadlineError, Config, Context, Editor, Helper};
use std::os::fd::{AsFd, OwnedFd};
use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot};

/// A command for the supervisor loop, typed into the shell or received on
/// the control socket, with the channel its outcome goes back on.
#[derive(Debug)]
pub struct ShellRequest {
    pub command: Command,
    pub reply: oneshot::Sender<Result<String, SupervisorError>>,
}

const COMMANDS: &[&str] = &["status", "stop", "stop-all", "help", "exit"];



/*
    @@@
    @CmdCompleter;
    . Completes command names at the start of the line.
    . After `stop ` or `status `, completes program names from the loaded config.
*/
struct CmdCompleter {
    programs: Vec<String>,
}
impl Helper for CmdCompleter {}
impl Hinter for CmdCompleter {
    type Hint = String;
}
impl Highlighter for CmdCompleter {}
impl Validator for CmdCompleter {}
impl Completer for CmdCompleter {
    type Candidate = Pair;
    fn complete(&self, line: &str, pos: usize, _ctx: &Context<'_>) -> Result<(usize, Vec<Pair>), ReadlineError> {
        let line = &line[..pos];
        let (start, prefix, pool): (usize, &str, Vec<&str>) = match line.split_once(' ') {
            None => (0, line, COMMANDS.to_vec()),
            Some(("stop" | "status", arg)) if !arg.contains(' ') => {
                (line.len() - arg.len(), arg, self.programs.iter().map(String::as_str).collect())
            }
            Some(_) => return Ok((pos, Vec::new())),
        };

        let matches = pool
            .into_iter()
            .filter(|candidate| candidate.starts_with(prefix))
            .map(|candidate| Pair {
                display: candidate.to_string(),
                replacement: candidate.to_string(),
            })
            .collect();
        Ok((start, matches))
    }
}



/*
    @@@
    @run_shell();
    . Blocking: runs on its own thread, since rustyline owns the terminal.
    . Parses each line and forwards valid commands to the supervisor loop, printing its reply.
    . `exit`, Ctrl-C and Ctrl-D all forward Exit and leave; history is kept in <log dir>/history.txt.
*/
pub fn run_shell(
    requests: mpsc::Sender<ShellRequest>,
    programs: Vec<String>,
    history: PathBuf,
) -> rustyline::Result<()> {
    let config = Config::builder().build();
    let mut rl: Editor<CmdCompleter, DefaultHistory> = Editor::with_config(config)?;
    rl.set_helper(Some(CmdCompleter { programs }));
    let _ = rl.load_history(&history);

    loop {
        let command = match rl.readline("forkvisor> ") {
            Ok(line) => {
                let input = line.trim();
                if !input.is_empty() {
                    rl.add_history_entry(input)?;
                }
                match parse_shell_line(input) {
                    Ok(Some(command)) => command,
                    Ok(None) => continue,
                    Err(e) => {
                        println!("{e}");
                        continue;
                    }
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => Command::Exit,
            Err(err) => {
                eprintln!("Error: {:?}", err);
                Command::Exit
            }
        };

        let exit = command == Command::Exit;
        let (reply, answer) = oneshot::channel();
        if requests.blocking_send(ShellRequest { command, reply }).is_err() {
            break;
        }
        match answer.blocking_recv() {
            Ok(Ok(text)) if !text.is_empty() => println!("{}", text.trim_end()),
            Ok(Err(e)) => println!("{e}"),
            _ => {}
        }
        if exit {
            break;
        }
    }

    rl.save_history(&history)?;
    Ok(())
}

/// Terminal attributes captured before the shell starts, put back on drop.
/// A shutdown signal can end the process while the shell thread is still
/// inside `readline` with the terminal in raw mode.
pub struct TerminalGuard {
    fd: OwnedFd,
    saved: Termios,
}

impl TerminalGuard {
    /// None when `fd` is not a terminal.
    pub fn save(fd: impl AsFd) -> Option<Self> {
        let fd = fd.as_fd().try_clone_to_owned().ok()?;
        let saved = tcgetattr(&fd).ok()?;
        Some(TerminalGuard { fd, saved })
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = tcsetattr(&self.fd, SetArg::TCSANOW, &self.saved);
    }
}
