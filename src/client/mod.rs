//! Thin RPC client used by the CLI sub-commands.
//!
//! Every helper opens its own short-lived connection, identifies with the
//! real terminal size, and speaks the same codec as the daemon. Multi-reply
//! requests (LIST_SESSIONS has no terminator frame) end on a short idle
//! timeout; single-reply requests wait longer but give up eventually.

pub mod attach;

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::UnixStream;
use tokio_util::codec::Framed;

use crate::paths;
use crate::protocol::{Message, MuxCodec, ProtocolError, SessionInfo};

/// Read timeout for single-reply requests.
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Idle timeout ending a multi-reply stream.
const LIST_IDLE_TIMEOUT: Duration = Duration::from_millis(500);

/// How long to poll for the socket after spawning the daemon.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Client-side failures, rendered to stderr by the CLI.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no server running")]
    NoServer,

    #[error("no sessions")]
    NoSessions,

    #[error("no response from server")]
    NoReply,

    #[error("failed to start server")]
    StartupTimeout,

    #[error("session '{0}' not found")]
    TargetNotFound(String),

    /// An ERROR frame from the daemon, verbatim.
    #[error("{0}")]
    Server(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Probe the daemon by connecting to its socket.
pub async fn is_server_running(socket_path: &Path) -> bool {
    matches!(
        tokio::time::timeout(Duration::from_secs(1), UnixStream::connect(socket_path)).await,
        Ok(Ok(_))
    )
}

/// Spawn `rmux server --daemon` if the socket is absent or refuses, then
/// poll until it accepts connections.
pub async fn ensure_server_running(socket_path: &Path) -> Result<(), ClientError> {
    if is_server_running(socket_path).await {
        return Ok(());
    }

    let exe = std::env::current_exe()?;
    std::process::Command::new(exe)
        .args(["server", "--daemon"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;

    let deadline = tokio::time::Instant::now() + STARTUP_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if is_server_running(socket_path).await {
            return Ok(());
        }
    }
    Err(ClientError::StartupTimeout)
}

/// The invoking terminal's size, with the VT100 default as fallback for
/// non-tty contexts.
pub(crate) fn terminal_size() -> (u16, u16) {
    crossterm::terminal::size().unwrap_or((80, 24))
}

pub(crate) async fn connect(
    socket_path: &Path,
) -> Result<Framed<UnixStream, MuxCodec>, ClientError> {
    let stream = UnixStream::connect(socket_path)
        .await
        .map_err(|_| ClientError::NoServer)?;
    Ok(Framed::new(stream, MuxCodec))
}

/// Send IDENTIFY plus `requests`, collect SESSION_INFO replies.
async fn request(
    socket_path: &Path,
    requests: Vec<Message>,
    expect_multiple: bool,
) -> Result<Vec<SessionInfo>, ClientError> {
    let mut framed = connect(socket_path).await?;
    let (cols, rows) = terminal_size();
    framed.send(Message::Identify { cols, rows }).await?;
    for msg in requests {
        framed.feed(msg).await?;
    }
    framed.flush().await?;

    let timeout = if expect_multiple {
        LIST_IDLE_TIMEOUT
    } else {
        REPLY_TIMEOUT
    };
    let mut results = Vec::new();
    loop {
        match tokio::time::timeout(timeout, framed.next()).await {
            Ok(Some(Ok(Message::SessionInfo(info)))) => {
                results.push(info);
                if !expect_multiple {
                    return Ok(results);
                }
            }
            Ok(Some(Ok(Message::Error { message }))) => return Err(ClientError::Server(message)),
            // Stray OUTPUT or exit notices are not ours to handle here.
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(e))) => return Err(e.into()),
            // EOF, or the idle timeout that stands in for a terminator.
            Ok(None) | Err(_) => break,
        }
    }
    Ok(results)
}

/// Create a session and return its info. The creating connection closes
/// afterwards; attach separately to interact.
pub async fn create_session(socket_path: &Path, name: &str) -> Result<SessionInfo, ClientError> {
    let mut results = request(
        socket_path,
        vec![Message::NewSession {
            name: name.to_string(),
        }],
        false,
    )
    .await?;
    results.pop().ok_or(ClientError::NoReply)
}

pub async fn list_sessions(socket_path: &Path) -> Result<Vec<SessionInfo>, ClientError> {
    request(socket_path, vec![Message::ListSessions], true).await
}

/// Resolve a target string: numeric ids match by id, anything else by name.
pub async fn find_session(socket_path: &Path, target: &str) -> Result<SessionInfo, ClientError> {
    let sessions = list_sessions(socket_path).await?;
    if sessions.is_empty() {
        return Err(ClientError::NoSessions);
    }
    let found = if let Ok(id) = target.parse::<u32>() {
        sessions.into_iter().find(|s| s.session_id == id)
    } else {
        sessions.into_iter().find(|s| s.name == target)
    };
    found.ok_or_else(|| ClientError::TargetNotFound(target.to_string()))
}

/// Resolve and kill a session. The daemon only replies on failure, so an
/// idle timeout counts as success.
pub async fn kill_session(socket_path: &Path, target: &str) -> Result<SessionInfo, ClientError> {
    let info = find_session(socket_path, target).await?;
    let mut framed = connect(socket_path).await?;
    framed
        .send(Message::KillSession {
            session_id: info.session_id,
        })
        .await?;
    match tokio::time::timeout(LIST_IDLE_TIMEOUT, framed.next()).await {
        Ok(Some(Ok(Message::Error { message }))) => Err(ClientError::Server(message)),
        _ => Ok(info),
    }
}

/// Read the PID file and SIGTERM the daemon. Returns a human-readable
/// status line. A stale PID file is unlinked.
pub fn kill_server(socket_path: &Path) -> Result<String, ClientError> {
    let pid_file = paths::pid_file_path(socket_path);
    let contents = std::fs::read_to_string(&pid_file)
        .map_err(|_| ClientError::Server("no server running (no PID file)".to_string()))?;
    let pid: i32 = contents
        .trim()
        .parse()
        .map_err(|_| ClientError::Server(format!("malformed PID file {}", pid_file.display())))?;

    match nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid),
        nix::sys::signal::Signal::SIGTERM,
    ) {
        Ok(()) => Ok(format!("sent SIGTERM to server (pid {pid})")),
        Err(nix::errno::Errno::ESRCH) => {
            let _ = std::fs::remove_file(&pid_file);
            Err(ClientError::Server(format!(
                "server not running (stale PID file for {pid})"
            )))
        }
        Err(e) => Err(ClientError::Server(format!(
            "failed to signal server (pid {pid}): {e}"
        ))),
    }
}
