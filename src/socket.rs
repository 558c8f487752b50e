use crate::cli::{parse_shell_line, Command};
use crate::shell::ShellRequest;
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// File name of the control socket inside the log directory.
pub const SOCKET_FILE: &str = "forkvisor.sock";

pub fn socket_path(directory: &Path) -> PathBuf {
    directory.join(SOCKET_FILE)
}

/// Answer of a running supervisor to one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Done(String),
    Refused(String),
}

/// Listening end of the control channel. The socket file is removed
/// when this is dropped.
#[derive(Debug)]
pub struct ControlSocket {
    listener: UnixListener,
    path: PathBuf,
}



/*
    @@@
    @ControlSocket::bind();
    . Binds a unix socket at `path`, creating the parent directory if needed.
    . A leftover socket file nobody answers on is replaced; a live one means another supervisor owns it and is an error.
*/
impl ControlSocket {
    pub async fn bind(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let listener = match UnixListener::bind(&path) {
            Ok(listener) => listener,
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                if UnixStream::connect(&path).await.is_ok() {
                    return Err(io::Error::new(
                        io::ErrorKind::AddrInUse,
                        format!("another supervisor is listening on {}", path.display()),
                    ));
                }
                info!(socket = %path.display(), "Replacing stale control socket");
                std::fs::remove_file(&path)?;
                UnixListener::bind(&path)?
            }
            Err(e) => return Err(e),
        };
        Ok(ControlSocket { listener, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn accept(&self) -> io::Result<UnixStream> {
        self.listener.accept().await.map(|(stream, _)| stream)
    }
}

impl Drop for ControlSocket {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}



/*
    @@@
    @serve_connection();
    . Reads one command line, parses it like a shell line and forwards it to the supervisor loop.
    . `exit` is refused: only the shell or a signal ends the supervisor.
    . Writes `ok` or `error` on the first line, then the output, and closes the connection.
*/
pub async fn serve_connection(stream: UnixStream, requests: mpsc::Sender<ShellRequest>) -> io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut line = String::new();
    BufReader::new(read).read_line(&mut line).await?;
    debug!(command = line.trim(), "Control request");

    let reply = match parse_shell_line(&line) {
        Ok(Some(Command::Exit)) => Reply::Refused("`exit` is only available in the shell".into()),
        Ok(Some(command)) => dispatch(command, &requests).await,
        Ok(None) => Reply::Refused("empty command".into()),
        Err(e) => Reply::Refused(e.to_string()),
    };

    let wire = match reply {
        Reply::Done(body) => format!("ok\n{body}"),
        Reply::Refused(body) => format!("error\n{body}"),
    };
    write.write_all(wire.as_bytes()).await?;
    write.shutdown().await
}

async fn dispatch(command: Command, requests: &mpsc::Sender<ShellRequest>) -> Reply {
    let (reply, answer) = oneshot::channel();
    if requests.send(ShellRequest { command, reply }).await.is_err() {
        return Reply::Refused("the supervisor is shutting down".into());
    }
    match answer.await {
        Ok(Ok(body)) => Reply::Done(body),
        Ok(Err(e)) => Reply::Refused(e.to_string()),
        Err(_) => Reply::Refused("the supervisor is shutting down".into()),
    }
}

/// Sends one command line to the supervisor listening on `path`.
pub async fn send_command(path: &Path, line: &str) -> io::Result<Reply> {
    let mut stream = UnixStream::connect(path).await?;
    stream.write_all(format!("{}\n", line.trim()).as_bytes()).await?;

    let mut raw = String::new();
    stream.read_to_string(&mut raw).await?;
    match raw.split_once('\n') {
        Some(("ok", body)) => Ok(Reply::Done(body.to_string())),
        Some(("error", body)) => Ok(Reply::Refused(body.to_string())),
        _ => Err(io::Error::new(io::ErrorKind::InvalidData, format!("unexpected reply `{raw}`"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stale_socket_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_path(dir.path());
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let socket = ControlSocket::bind(&path).await.unwrap();
        assert_eq!(socket.path(), path);
        drop(socket);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn live_socket_is_not_stolen() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_path(dir.path());
        let _owner = ControlSocket::bind(&path).await.unwrap();

        let err = ControlSocket::bind(&path).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
    }

    #[tokio::test]
    async fn exit_and_garbage_are_refused_without_reaching_the_supervisor() {
        let dir = tempfile::tempdir().unwrap();
        let socket = ControlSocket::bind(socket_path(dir.path())).await.unwrap();
        let (tx, mut rx) = mpsc::channel::<ShellRequest>(1);

        let server = tokio::spawn(async move {
            for _ in 0..2 {
                let stream = socket.accept().await.unwrap();
                serve_connection(stream, tx.clone()).await.unwrap();
            }
        });

        let path = socket_path(dir.path());
        assert!(matches!(send_command(&path, "exit").await.unwrap(), Reply::Refused(_)));
        assert!(matches!(send_command(&path, "reload all").await.unwrap(), Reply::Refused(_)));
        server.await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}
