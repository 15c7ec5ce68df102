//! PTY allocation, shell spawning, and terminal resize.
//!
//! Uses the `nix` crate for POSIX PTY APIs. The PTY master fd is kept alive
//! for the pane lifetime so I/O and resize operations can be performed on it;
//! reads and writes go through dup'd handles wrapped in [`tokio::fs::File`],
//! which runs the blocking syscalls on the executor's blocking pool.

use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

use nix::pty::{openpty, OpenptyResult, Winsize};

use crate::error::PtyError;

fn winsize(cols: u16, rows: u16) -> Winsize {
    Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

/// An allocated PTY pair (master + slave).
pub struct PtyPair {
    pub master: OwnedFd,
    pub slave: OwnedFd,
}

/// Allocate a PTY pair with the given terminal size.
pub fn allocate(cols: u16, rows: u16) -> Result<PtyPair, PtyError> {
    let OpenptyResult { master, slave } =
        openpty(&winsize(cols, rows), None).map_err(PtyError::Allocate)?;
    Ok(PtyPair { master, slave })
}

/// Spawn a shell on the slave side of the PTY. Returns the child pid.
///
/// The child becomes a session leader with the PTY slave as its controlling
/// terminal, stdin/stdout/stderr all connected to the slave fd, and
/// `TERM=xterm-256color` in its environment. The returned pid is *not*
/// wrapped in a `Child` handle — the daemon reaps children itself via its
/// SIGCHLD handler, so the spawn goes through `std::process::Command` which
/// leaves wait() responsibility with the caller.
pub fn spawn_shell(pty: &PtyPair, shell: &str) -> Result<u32, PtyError> {
    let master_fd = pty.master.as_raw_fd();
    let slave_fd = pty.slave.as_raw_fd();

    let mut cmd = Command::new(shell);
    cmd.env("TERM", "xterm-256color");

    // The child's stdio is handled by pre_exec (dup2 to PTY slave), so no
    // pipes are set up here.
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    // SAFETY: All syscalls used here are async-signal-safe per POSIX.
    unsafe {
        cmd.pre_exec(move || {
            // Create a new session so the child is the session leader
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            // Set the PTY slave as the controlling terminal
            if libc::ioctl(slave_fd, libc::TIOCSCTTY, 0) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            // Redirect stdin/stdout/stderr to the PTY slave
            libc::dup2(slave_fd, 0);
            libc::dup2(slave_fd, 1);
            libc::dup2(slave_fd, 2);
            if slave_fd > 2 {
                libc::close(slave_fd);
            }
            // The master belongs to the daemon only; an inherited copy in the
            // child would keep EOF from ever reaching the pump.
            libc::close(master_fd);
            Ok(())
        });
    }

    let child = cmd.spawn().map_err(|source| PtyError::Spawn {
        shell: shell.to_string(),
        source,
    })?;
    Ok(child.id())
}

/// Resize a PTY's terminal window.
pub fn resize(master: &OwnedFd, cols: u16, rows: u16) -> Result<(), PtyError> {
    let size = winsize(cols, rows);
    // SAFETY: TIOCSWINSZ is a well-defined ioctl that reads a Winsize struct.
    let ret = unsafe {
        libc::ioctl(
            master.as_raw_fd(),
            libc::TIOCSWINSZ,
            std::ptr::addr_of!(size),
        )
    };
    if ret == -1 {
        Err(PtyError::Resize(nix::Error::last()))
    } else {
        Ok(())
    }
}

/// Dup the master into an independent async handle for reading.
///
/// `tokio::fs::File` delegates the blocking `read` to the blocking pool, so
/// the PTY read is a proper suspension point on the event loop.
pub fn async_reader(master: &OwnedFd) -> Result<tokio::fs::File, PtyError> {
    let dup = master.try_clone().map_err(PtyError::CloneFd)?;
    Ok(tokio::fs::File::from_std(std::fs::File::from(dup)))
}

/// Dup the master into an independent async handle for writing.
pub fn async_writer(master: &OwnedFd) -> Result<tokio::fs::File, PtyError> {
    let dup = master.try_clone().map_err(PtyError::CloneFd)?;
    Ok(tokio::fs::File::from_std(std::fs::File::from(dup)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::wait::{waitpid, WaitPidFlag};
    use nix::unistd::Pid;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn spawned_shell_echoes_through_master() {
        let pty = allocate(80, 24).unwrap();
        let pid = spawn_shell(&pty, "/bin/sh").unwrap();
        assert!(pid > 0);
        drop(pty.slave);

        let mut writer = async_writer(&pty.master).unwrap();
        let mut reader = async_reader(&pty.master).unwrap();
        writer.write_all(b"echo pty_probe_91\n").await.unwrap();

        let mut collected = Vec::new();
        let mut buf = [0u8; 4096];
        let deadline = tokio::time::Instant::now() + tokio::time::Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            let n = tokio::time::timeout(
                tokio::time::Duration::from_millis(500),
                reader.read(&mut buf),
            )
            .await;
            match n {
                Ok(Ok(n)) if n > 0 => collected.extend_from_slice(&buf[..n]),
                _ => {}
            }
            if collected
                .windows(b"pty_probe_91".len())
                .any(|w| w == b"pty_probe_91")
            {
                break;
            }
        }
        let text = String::from_utf8_lossy(&collected);
        assert!(text.contains("pty_probe_91"), "got: {text}");

        // Clean up the shell.
        let _ = nix::sys::signal::kill(
            Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGKILL,
        );
        let _ = waitpid(Pid::from_raw(pid as i32), Some(WaitPidFlag::empty()));
    }

    #[test]
    fn resize_succeeds_on_live_master() {
        let pty = allocate(80, 24).unwrap();
        resize(&pty.master, 120, 40).unwrap();
    }
}
