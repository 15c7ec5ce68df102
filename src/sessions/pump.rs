//! Per-session PTY fan-out pump.
//!
//! At most one pump task exists per session. It is the only reader of the
//! pane's PTY master: bytes go into the emulator first (unconditionally, so
//! the replay snapshot stays current with zero watchers), then out to every
//! attached client as an OUTPUT frame.
//!
//! Ordering: the emulator feed and the collection of attached senders happen
//! under the shared write lock, so an ATTACH — which renders its snapshot and
//! enqueues it under the same lock — can never interleave between the two.
//! Per-client frame channels are FIFO, which carries the guarantee the rest
//! of the way: replay strictly before any later live output, live output in
//! PTY order.

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

use crate::protocol::Message;
use crate::sessions::{Shared, SharedState};

/// Read size per loop iteration.
const READ_CHUNK: usize = 4096;

/// Start the fan-out pump for a session if it is not already running.
///
/// Idempotent; called with the shared write guard held by whichever
/// operation first attaches a client (NEW_SESSION or ATTACH).
pub fn start(shared: &SharedState, guard: &mut Shared, session_id: u32) {
    if guard
        .pumps
        .get(&session_id)
        .is_some_and(|handle| !handle.is_finished())
    {
        return;
    }
    let Some(session) = guard.registry.session_mut(session_id) else {
        return;
    };
    let pane_id = session.active_pane_id;
    let Some(reader) = session.active_pane_mut().take_reader() else {
        // Reader already consumed: a finished pump means the pane is dead,
        // and ATTACH answers dead panes before getting here.
        return;
    };
    let handle = tokio::spawn(run(shared.clone(), session_id, pane_id, reader));
    guard.pumps.insert(session_id, handle);
    debug!("session {session_id}: pump started (pane {pane_id})");
}

/// The pump body: PTY master → emulator + every attached client.
async fn run(
    shared: SharedState,
    session_id: u32,
    pane_id: u32,
    mut reader: tokio::fs::File,
) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("session {session_id}: pty read error: {e}");
                break;
            }
        };

        let targets = {
            let mut st = shared.write().await;
            let Some(pane) = st
                .registry
                .session_mut(session_id)
                .and_then(|s| s.panes.get_mut(&pane_id))
            else {
                // Session was killed while we were reading.
                return;
            };
            pane.term.feed(&buf[..n]);
            st.output_targets(session_id)
        };

        let frame = Message::Output(Bytes::copy_from_slice(&buf[..n]));
        let mut stale = Vec::new();
        for (client_id, tx) in targets {
            // One client at a time, in stable order. A failed send means the
            // client's writer task is gone; evict it, keep pumping.
            if tx.send(frame.clone()).await.is_err() {
                stale.push(client_id);
            }
        }
        if !stale.is_empty() {
            let mut st = shared.write().await;
            for client_id in stale {
                let _ = st.registry.detach(session_id, client_id);
                debug!("session {session_id}: evicted client {client_id}");
            }
        }
    }

    // Shell reached end-of-stream: flag the pane and tell the watchers. The
    // session itself stays — the user may want to reattach and read the
    // final screen, or kill it explicitly.
    let targets = {
        let mut st = shared.write().await;
        let Some(pane) = st
            .registry
            .session_mut(session_id)
            .and_then(|s| s.panes.get_mut(&pane_id))
        else {
            return;
        };
        pane.mark_dead();
        st.output_targets(session_id)
    };
    info!("session {session_id}: shell exited (pane {pane_id})");
    for (_, tx) in targets {
        let _ = tx
            .send(Message::ShellExited {
                session_id,
                pane_id,
            })
            .await;
    }
}
