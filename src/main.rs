use anyhow::{anyhow, Context};
use forkvisor::cli::{parse_args, Command, USAGE};
use forkvisor::control::Supervisor;
use forkvisor::logger::{logs_tracing, LogSettings};
use forkvisor::parse::load_file;
use forkvisor::runtime::OsSpawner;
use forkvisor::shell::{run_shell, ShellRequest, TerminalGuard};
use forkvisor::signals::ShutdownSignals;
use forkvisor::socket::{send_command, serve_connection, socket_path, ControlSocket, Reply};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    let command = match parse_args(std::env::args().skip(1)) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("{e}\n\n{USAGE}");
            return ExitCode::from(2);
        }
    };

    let result = match command {
        Command::Start { config, shell, log_dir } => run_start(&config, shell, log_dir).await,
        Command::Check { config } => run_check(&config),
        Command::Remote { line, log_dir } => run_remote(&line, log_dir).await,
        _ => {
            println!("{USAGE}");
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("forkvisor: {e:#}");
            ExitCode::from(1)
        }
    }
}

fn run_check(config: &Path) -> anyhow::Result<()> {
    let specs = load_file(config)?;
    for spec in &specs {
        println!(
            "{:<32} x{}  restart_delay={}ms  {}",
            spec.name,
            spec.instance_count,
            spec.restart_delay.as_millis(),
            spec.command_line()
        );
    }
    println!("{}: {} program(s) OK", config.display(), specs.len());
    Ok(())
}



/*
    @@@
    @run_remote();
    . Sends one command line to the supervisor listening in the log directory (default `logs`).
    . Prints its output on success; a refusal (e.g. an unknown program) is returned as an error, so the exit code is 1.
*/
async fn run_remote(line: &str, log_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let directory = log_dir.unwrap_or_else(|| LogSettings::default().directory);
    let path = socket_path(&directory);
    let reply = send_command(&path, line)
        .await
        .with_context(|| format!("no supervisor reachable at {}", path.display()))?;
    match reply {
        Reply::Done(text) => {
            if !text.is_empty() {
                println!("{}", text.trim_end());
            }
            Ok(())
        }
        Reply::Refused(text) => Err(anyhow!(text)),
    }
}



/*
    @@@
    @run_start();
    . Loads the config first; a ConfigError aborts before logging is even set up or anything launches.
    . Starts every program and opens the control socket (<log dir>/forkvisor.sock) for `status`, `stop` and `stop-all` from other terminals.
    . Serves shell and socket requests until `exit`, end of input, or a shutdown signal.
    . Always finishes with stop_all() so no child outlives the supervisor, then restores the terminal the shell may have left in raw mode.
*/
async fn run_start(config: &Path, shell: bool, log_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let specs = load_file(config)?;

    let settings = LogSettings::from_env(log_dir.as_deref())?;
    let _guard = logs_tracing(&settings)?;
    info!(config = %config.display(), programs = specs.len(), "Loaded configuration");

    let supervisor = Supervisor::new(Arc::new(OsSpawner));
    let mut signals = ShutdownSignals::register().context("cannot register signal handlers")?;
    let socket = ControlSocket::bind(socket_path(&settings.directory))
        .await
        .context("cannot open the control socket")?;
    let launched = supervisor.start(specs).await?;
    info!(instances = launched, socket = %socket.path().display(), "Supervisor running");

    let (tx, mut rx) = mpsc::channel::<ShellRequest>(8);
    // socket connections borrow the sender; the loop ends once the shell drops it
    let connections = tx.downgrade();
    let _terminal = if shell { TerminalGuard::save(std::io::stdin()) } else { None };
    let _keep_open = if shell {
        let programs = supervisor.names().await;
        let history = settings.directory.join("history.txt");
        // plain thread: a pending readline must not hold up runtime shutdown
        std::thread::Builder::new()
            .name("shell".into())
            .spawn(move || {
                if let Err(e) = run_shell(tx, programs, history) {
                    error!(error = %e, "Shell failed");
                }
            })
            .context("cannot start the shell thread")?;
        None
    } else {
        println!("forkvisor: supervising {launched} instance(s); send SIGINT or SIGTERM to stop");
        Some(tx)
    };

    loop {
        tokio::select! {
            request = rx.recv() => {
                let Some(ShellRequest { command, reply }) = request else { break };
                let exit = command == Command::Exit;
                let _ = reply.send(supervisor.execute(command).await);
                if exit {
                    break;
                }
            }
            conn = socket.accept() => match conn {
                Ok(stream) => {
                    if let Some(requests) = connections.upgrade() {
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, requests).await {
                                warn!(error = %e, "Control connection failed");
                            }
                        });
                    }
                }
                Err(e) => warn!(error = %e, "Control socket accept failed"),
            },
            _ = signals.recv() => break,
        }
    }

    supervisor.stop_all().await;
    info!("Supervisor exited");
    Ok(())
}
