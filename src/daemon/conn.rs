//! Per-connection protocol handling.
//!
//! ## Connection lifecycle
//!
//! 1. A client connects to the Unix socket and sends IDENTIFY with its
//!    terminal size, then drives the session operations below.
//! 2. Outgoing frames are funneled through an mpsc channel so the fan-out
//!    pump and this dispatcher can both send without sharing the socket.
//! 3. On disconnect — EOF, I/O error, or a failed dispatch — the connection
//!    is removed from its session's attachment set. The session lives on.
//!
//! ## Dispatch rules
//!
//! | Frame          | Precondition | Effect / reply                               |
//! |----------------|--------------|----------------------------------------------|
//! | IDENTIFY       | —            | records declared dimensions, no reply        |
//! | NEW_SESSION    | IDENTIFY     | create + attach + pump, SESSION_INFO         |
//! | ATTACH         | session live | snapshot OUTPUT, then SESSION_INFO           |
//! | INPUT          | attached     | payload → active pane's PTY                  |
//! | RESIZE         | attached     | PTY ioctl + emulator resize (last one wins)  |
//! | DETACH         | —            | leave the attachment set, no reply           |
//! | LIST_SESSIONS  | —            | one SESSION_INFO per session, no terminator  |
//! | KILL_SESSION   | —            | detach watchers, cancel pump, destroy        |
//!
//! A dead active pane answers ATTACH with an immediate SHELL_EXITED and no
//! attachment. Dispatch errors become a best-effort ERROR frame, after which
//! the connection closes.

use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{PtyError, RegistryError};
use crate::protocol::{Message, MuxCodec, SessionInfo};
use crate::sessions::{pump, Session, SharedState};

/// Why a dispatch step failed. Rendered into the ERROR frame the client sees.
#[derive(Debug, Error)]
enum DispatchError {
    #[error("IDENTIFY must precede NEW_SESSION")]
    NotIdentified,

    #[error("not attached to any session")]
    NotAttached,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Pty(#[from] PtyError),
}

/// Soft per-connection state.
struct ConnState {
    client_id: u64,
    /// Declared terminal size from IDENTIFY.
    dims: Option<(u16, u16)>,
    /// The one session this client is attached to, if any.
    attached: Option<u32>,
}

/// Serve one accepted connection until EOF, error, or a failed dispatch.
pub async fn handle_client(
    stream: UnixStream,
    client_id: u64,
    shared: SharedState,
    config: Arc<Config>,
) {
    let framed = Framed::new(stream, MuxCodec);
    let (mut sink, mut frames) = framed.split();

    // Outgoing frames from the dispatcher and the pump meet here; the writer
    // task is the only owner of the socket's send half.
    let (tx, mut rx) = mpsc::channel::<Message>(256);
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    shared.write().await.clients.insert(client_id, tx.clone());
    debug!("client {client_id}: connected");

    let mut conn = ConnState {
        client_id,
        dims: None,
        attached: None,
    };

    loop {
        match frames.next().await {
            Some(Ok(msg)) => {
                if let Err(e) = dispatch(&shared, &config, &mut conn, &tx, msg).await {
                    warn!("client {client_id}: {e}");
                    let _ = tx
                        .send(Message::Error {
                            message: e.to_string(),
                        })
                        .await;
                    break;
                }
            }
            Some(Err(e)) => {
                warn!("client {client_id}: protocol error: {e}");
                let _ = tx
                    .send(Message::Error {
                        message: e.to_string(),
                    })
                    .await;
                break;
            }
            None => break,
        }
    }

    // Teardown: the detach is guaranteed on every exit path.
    {
        let mut st = shared.write().await;
        if let Some(session_id) = conn.attached.take() {
            let _ = st.registry.detach(session_id, client_id);
        }
        st.clients.remove(&client_id);
    }

    // Let queued frames flush, then cut the writer loose.
    drop(tx);
    if tokio::time::timeout(std::time::Duration::from_secs(1), &mut send_task)
        .await
        .is_err()
    {
        send_task.abort();
    }
    debug!("client {client_id}: disconnected");
}

async fn dispatch(
    shared: &SharedState,
    config: &Config,
    conn: &mut ConnState,
    tx: &mpsc::Sender<Message>,
    msg: Message,
) -> Result<(), DispatchError> {
    match msg {
        Message::Identify { cols, rows } => {
            conn.dims = Some((cols, rows));
            Ok(())
        }
        Message::NewSession { name } => handle_new_session(shared, config, conn, tx, name).await,
        Message::Attach { session_id } => handle_attach(shared, conn, tx, session_id).await,
        Message::Input(data) => {
            let session_id = conn.attached.ok_or(DispatchError::NotAttached)?;
            let st = shared.read().await;
            let session = st
                .registry
                .session(session_id)
                .ok_or_else(|| RegistryError::SessionNotFound(session_id.to_string()))?;
            session.active_pane().write_input(data.to_vec()).await?;
            Ok(())
        }
        Message::Resize { cols, rows } => {
            let session_id = conn.attached.ok_or(DispatchError::NotAttached)?;
            let mut st = shared.write().await;
            let session = st
                .registry
                .session_mut(session_id)
                .ok_or_else(|| RegistryError::SessionNotFound(session_id.to_string()))?;
            // Attached clients share the pane: the last resize wins.
            session.active_pane_mut().resize(cols, rows)?;
            conn.dims = Some((cols, rows));
            Ok(())
        }
        Message::Detach => {
            if let Some(session_id) = conn.attached.take() {
                let _ = shared
                    .write()
                    .await
                    .registry
                    .detach(session_id, conn.client_id);
                debug!("client {}: detached from session {session_id}", conn.client_id);
            }
            Ok(())
        }
        Message::ListSessions => {
            let infos: Vec<SessionInfo> = {
                let st = shared.read().await;
                st.registry
                    .session_ids()
                    .into_iter()
                    .filter_map(|id| {
                        st.registry
                            .session(id)
                            .map(|s| session_info(s, st.registry.attached_count(id)))
                    })
                    .collect()
            };
            // No terminator frame: clients end the read on an idle timeout.
            for info in infos {
                let _ = tx.send(Message::SessionInfo(info)).await;
            }
            Ok(())
        }
        Message::KillSession { session_id } => handle_kill_session(shared, conn, tx, session_id).await,
        // Daemon-bound traffic only; the reply frames are never valid here.
        other => {
            let _ = tx
                .send(Message::Error {
                    message: format!("unhandled message type {}", other.kind()),
                })
                .await;
            Ok(())
        }
    }
}

/// NEW_SESSION: create at the client's declared size, attach, reply, pump.
async fn handle_new_session(
    shared: &SharedState,
    config: &Config,
    conn: &mut ConnState,
    tx: &mpsc::Sender<Message>,
    name: String,
) -> Result<(), DispatchError> {
    let (cols, rows) = conn.dims.ok_or(DispatchError::NotIdentified)?;
    let shell = config.shell_command();

    let mut st = shared.write().await;
    let name = if name.is_empty() {
        st.registry.default_session_name()
    } else {
        name
    };
    let session_id = st.registry.create_session(&name, &shell, cols, rows)?.id;
    // A client watches at most one session; creating a new one leaves the old.
    if let Some(old) = conn.attached.take() {
        let _ = st.registry.detach(old, conn.client_id);
    }
    st.registry.attach(session_id, conn.client_id)?;

    let info = st
        .registry
        .session(session_id)
        .map(|s| session_info(s, st.registry.attached_count(session_id)))
        .expect("session created above");
    // The reply goes out before the pump can enqueue the first prompt bytes.
    let _ = tx.send(Message::SessionInfo(info)).await;

    pump::start(shared, &mut st, session_id);
    conn.attached = Some(session_id);
    Ok(())
}

/// ATTACH: replay snapshot, record the attachment, reply, pump.
///
/// Everything happens under the write lock, so the snapshot OUTPUT and the
/// SESSION_INFO are enqueued before the pump can observe the new watcher —
/// that is the whole replay-before-live guarantee.
async fn handle_attach(
    shared: &SharedState,
    conn: &mut ConnState,
    tx: &mpsc::Sender<Message>,
    session_id: u32,
) -> Result<(), DispatchError> {
    let mut st = shared.write().await;
    let session = st
        .registry
        .session(session_id)
        .ok_or_else(|| RegistryError::SessionNotFound(session_id.to_string()))?;

    if session.active_pane().is_dead() {
        let pane_id = session.active_pane_id;
        drop(st);
        let _ = tx
            .send(Message::ShellExited {
                session_id,
                pane_id,
            })
            .await;
        return Ok(());
    }

    // A client watches at most one session; switching leaves the old set.
    if let Some(old) = conn.attached.take() {
        let _ = st.registry.detach(old, conn.client_id);
    }
    st.registry.attach(session_id, conn.client_id)?;

    let session = st
        .registry
        .session(session_id)
        .expect("attach succeeded above");
    let snapshot = session.active_pane().term.snapshot();
    let info = session_info(session, st.registry.attached_count(session_id));

    let _ = tx.send(Message::Output(Bytes::from(snapshot))).await;
    let _ = tx.send(Message::SessionInfo(info)).await;

    pump::start(shared, &mut st, session_id);
    conn.attached = Some(session_id);
    Ok(())
}

/// KILL_SESSION: unknown targets get an ERROR reply but keep the connection.
async fn handle_kill_session(
    shared: &SharedState,
    conn: &mut ConnState,
    tx: &mpsc::Sender<Message>,
    session_id: u32,
) -> Result<(), DispatchError> {
    let mut st = shared.write().await;
    if st.registry.session(session_id).is_none() {
        let _ = tx
            .send(Message::Error {
                message: format!("session {session_id} not found"),
            })
            .await;
        return Ok(());
    }

    if let Ok(watchers) = st.registry.attached(session_id) {
        for client_id in watchers {
            let _ = st.registry.detach(session_id, client_id);
        }
    }
    if conn.attached == Some(session_id) {
        conn.attached = None;
    }
    if let Some(handle) = st.pumps.remove(&session_id) {
        handle.abort();
    }
    st.registry.destroy_session(session_id)?;
    Ok(())
}

fn session_info(session: &Session, attached: usize) -> SessionInfo {
    let pane = session.active_pane();
    SessionInfo {
        session_id: session.id,
        name: session.name.clone(),
        pane_id: pane.id,
        pid: pane.pid,
        cols: pane.cols,
        rows: pane.rows,
        created_at: session.created_at,
        attached: attached as u32,
    }
}
