//! Session and pane state.
//!
//! A [`Pane`] owns one PTY master and the emulator that shadows it; a
//! [`Session`] is a named collection of panes sharing a lifetime. Both are
//! plain data owned exclusively by the [`crate::sessions::Registry`] — client
//! connections refer to them by id only.

use std::collections::BTreeMap;
use std::os::fd::OwnedFd;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::PtyError;
use crate::pty;
use crate::term::TerminalEmulator;

/// Wall-clock seconds since the epoch, as carried by SESSION_INFO frames.
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}

/// Smallest usable terminal; anything below falls back to the VT100 default.
pub const MIN_COLS: u16 = 20;
pub const MIN_ROWS: u16 = 10;
pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

/// Clamp requested dimensions to something a shell can actually use.
pub fn normalize_dimensions(cols: u16, rows: u16) -> (u16, u16) {
    let cols = if cols < MIN_COLS { DEFAULT_COLS } else { cols };
    let rows = if rows < MIN_ROWS { DEFAULT_ROWS } else { rows };
    (cols, rows)
}

/// One PTY-backed terminal: master fd, shell pid, emulator state.
pub struct Pane {
    pub id: u32,
    pub pid: u32,
    pub cols: u16,
    pub rows: u16,
    /// Kept open for the pane lifetime; resize and close operate on it.
    master: OwnedFd,
    /// Feeds the writer task; INPUT payloads go through here so partial
    /// writes are retried by `write_all` without blocking the dispatcher.
    input_tx: mpsc::Sender<Vec<u8>>,
    writer_task: tokio::task::JoinHandle<()>,
    /// Taken once by the fan-out pump when it starts.
    reader: Option<tokio::fs::File>,
    pub term: TerminalEmulator,
    pub dead: bool,
    pub exit_code: Option<i32>,
}

impl Pane {
    /// Allocate a PTY, spawn `shell` on it, and start the writer task.
    pub fn spawn(
        id: u32,
        shell: &str,
        cols: u16,
        rows: u16,
        scrollback_lines: usize,
    ) -> Result<Self, PtyError> {
        let (cols, rows) = normalize_dimensions(cols, rows);
        let pair = pty::allocate(cols, rows)?;
        let pid = pty::spawn_shell(&pair, shell)?;
        // The child holds its own slave fd; ours would keep EOF from
        // reaching the reader after the shell exits.
        drop(pair.slave);

        let reader = pty::async_reader(&pair.master)?;
        let mut writer = pty::async_writer(&pair.master)?;

        let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(64);
        let writer_task = tokio::spawn(async move {
            while let Some(data) = input_rx.recv().await {
                if writer.write_all(&data).await.is_err() {
                    break;
                }
                if writer.flush().await.is_err() {
                    break;
                }
            }
        });

        debug!("pane {id}: spawned {shell} (pid {pid}, {cols}x{rows})");
        Ok(Pane {
            id,
            pid,
            cols,
            rows,
            master: pair.master,
            input_tx,
            writer_task,
            reader: Some(reader),
            term: TerminalEmulator::new(cols, rows, scrollback_lines),
            dead: false,
            exit_code: None,
        })
    }

    /// Queue raw input for the shell. Fails only when the writer task is
    /// gone, i.e. the PTY broke.
    pub async fn write_input(&self, data: Vec<u8>) -> Result<(), PtyError> {
        self.input_tx
            .send(data)
            .await
            .map_err(|_| PtyError::InputClosed)
    }

    /// Resize PTY and emulator together; the two must never disagree.
    pub fn resize(&mut self, cols: u16, rows: u16) -> Result<(), PtyError> {
        let (cols, rows) = normalize_dimensions(cols, rows);
        pty::resize(&self.master, cols, rows)?;
        self.cols = cols;
        self.rows = rows;
        self.term.resize(cols, rows);
        Ok(())
    }

    /// Hand the read half to the fan-out pump. Returns `None` after the
    /// first call — at most one pump reads a pane.
    pub fn take_reader(&mut self) -> Option<tokio::fs::File> {
        self.reader.take()
    }

    pub fn mark_dead(&mut self) {
        self.dead = true;
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// Best-effort terminate + reap, used by destroy paths. ESRCH (already
    /// gone) is not an error.
    pub fn terminate(&self) {
        let pid = nix::unistd::Pid::from_raw(self.pid as i32);
        match nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
            Err(e) => debug!("pane {}: SIGTERM failed: {e}", self.id),
        }
        let _ = nix::sys::wait::waitpid(pid, Some(nix::sys::wait::WaitPidFlag::WNOHANG));
    }

    /// SIGKILL the shell outright (daemon shutdown path).
    pub fn kill(&self) {
        let pid = nix::unistd::Pid::from_raw(self.pid as i32);
        let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL);
    }
}

impl Drop for Pane {
    fn drop(&mut self) {
        // The master OwnedFd closes itself; the writer task would otherwise
        // sit on a dead fd forever.
        self.writer_task.abort();
    }
}

/// A named collection of panes sharing a lifetime.
pub struct Session {
    pub id: u32,
    pub name: String,
    /// BTreeMap so "lowest remaining pane id" promotion is deterministic.
    pub panes: BTreeMap<u32, Pane>,
    pub active_pane_id: u32,
    pub created_at: f64,
}

impl Session {
    pub fn active_pane(&self) -> &Pane {
        self.panes
            .get(&self.active_pane_id)
            .expect("active_pane_id is always a key in panes")
    }

    pub fn active_pane_mut(&mut self) -> &mut Pane {
        self.panes
            .get_mut(&self.active_pane_id)
            .expect("active_pane_id is always a key in panes")
    }
}
