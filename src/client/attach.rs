//! Interactive attach client: raw-mode passthrough between the invoking
//! terminal and a daemon session.
//!
//! The daemon already speaks ANSI, so the client does no rendering of its
//! own: OUTPUT payloads go to stdout verbatim and raw stdin bytes go back as
//! INPUT frames. The only interception is the `Ctrl-b` prefix — `Ctrl-b d`
//! detaches, `Ctrl-b <anything else>` forwards both bytes untouched. Window
//! size changes are forwarded as RESIZE frames.

use std::path::Path;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::signal::unix::{signal, SignalKind};

use crate::client::{connect, terminal_size, ClientError};
use crate::protocol::Message;

/// What to attach to: a fresh session or an existing one.
pub enum AttachTarget {
    Create { name: String },
    Existing { session_id: u32 },
}

/// Restores cooked mode on every exit path, including errors.
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> std::io::Result<Self> {
        crossterm::terminal::enable_raw_mode()?;
        Ok(RawModeGuard)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = crossterm::terminal::disable_raw_mode();
    }
}

/// Prefix-chord state machine over the raw input byte stream.
///
/// `Ctrl-b` (0x02) arms the prefix, possibly at the very end of one read
/// chunk with the deciding key in the next. `d` then requests detach; any
/// other key forwards the swallowed prefix together with that key.
#[derive(Default)]
struct ChordScanner {
    prefix_active: bool,
}

const PREFIX: u8 = 0x02;

impl ChordScanner {
    /// Scan one chunk, pushing passthrough bytes into `forward`. Returns
    /// true when the detach chord completed.
    fn scan(&mut self, input: &[u8], forward: &mut Vec<u8>) -> bool {
        for &byte in input {
            if self.prefix_active {
                self.prefix_active = false;
                if byte == b'd' {
                    return true;
                }
                forward.push(PREFIX);
                forward.push(byte);
            } else if byte == PREFIX {
                self.prefix_active = true;
            } else {
                forward.push(byte);
            }
        }
        false
    }
}

/// Attach to the daemon and shuttle bytes until detach, shell exit, or
/// disconnect. Returns the status line to print after the terminal is
/// restored.
pub async fn run(socket_path: &Path, target: AttachTarget) -> Result<String, ClientError> {
    let framed = connect(socket_path).await?;
    let (mut sink, mut frames) = framed.split();

    let (cols, rows) = terminal_size();
    sink.send(Message::Identify { cols, rows }).await?;
    match target {
        AttachTarget::Create { name } => sink.send(Message::NewSession { name }).await?,
        AttachTarget::Existing { session_id } => {
            sink.send(Message::Attach { session_id }).await?;
        }
    }

    let _raw = RawModeGuard::enable()?;
    let mut stdout = tokio::io::stdout();
    let mut stdin = tokio::io::stdin();
    let mut sigwinch = signal(SignalKind::window_change())?;
    let mut scanner = ChordScanner::default();
    let mut input_buf = [0u8; 1024];

    let outcome = loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(Message::Output(data))) => {
                    stdout.write_all(&data).await?;
                    stdout.flush().await?;
                }
                Some(Ok(Message::SessionInfo(_))) => {}
                Some(Ok(Message::ShellExited { .. })) => break "[shell exited]".to_string(),
                Some(Ok(Message::Error { message })) => return Err(ClientError::Server(message)),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => break "[server closed the connection]".to_string(),
            },
            read = stdin.read(&mut input_buf) => match read {
                Ok(0) => break "[stdin closed]".to_string(),
                Ok(n) => {
                    let mut forward = Vec::with_capacity(n);
                    let detach = scanner.scan(&input_buf[..n], &mut forward);
                    if !forward.is_empty() {
                        sink.send(Message::Input(Bytes::from(forward))).await?;
                    }
                    if detach {
                        let _ = sink.send(Message::Detach).await;
                        break "[detached]".to_string();
                    }
                }
                Err(e) => return Err(e.into()),
            },
            _ = sigwinch.recv() => {
                let (cols, rows) = terminal_size();
                let _ = sink.send(Message::Resize { cols, rows }).await;
            }
        }
    };
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_all(scanner: &mut ChordScanner, input: &[u8]) -> (Vec<u8>, bool) {
        let mut forward = Vec::new();
        let detach = scanner.scan(input, &mut forward);
        (forward, detach)
    }

    #[test]
    fn plain_bytes_pass_through() {
        let mut s = ChordScanner::default();
        let (fwd, detach) = scan_all(&mut s, b"echo hello\r");
        assert_eq!(fwd, b"echo hello\r");
        assert!(!detach);
    }

    #[test]
    fn prefix_then_d_detaches() {
        let mut s = ChordScanner::default();
        let (fwd, detach) = scan_all(&mut s, &[PREFIX, b'd']);
        assert!(fwd.is_empty());
        assert!(detach);
    }

    #[test]
    fn prefix_then_other_key_forwards_both() {
        let mut s = ChordScanner::default();
        let (fwd, detach) = scan_all(&mut s, &[PREFIX, b'x']);
        assert_eq!(fwd, vec![PREFIX, b'x']);
        assert!(!detach);
    }

    #[test]
    fn prefix_survives_chunk_boundary() {
        let mut s = ChordScanner::default();
        let (fwd, detach) = scan_all(&mut s, &[b'a', PREFIX]);
        assert_eq!(fwd, b"a");
        assert!(!detach);
        let (fwd, detach) = scan_all(&mut s, b"d");
        assert!(fwd.is_empty());
        assert!(detach);
    }

    #[test]
    fn bytes_before_chord_still_forward() {
        let mut s = ChordScanner::default();
        let (fwd, detach) = scan_all(&mut s, &[b'l', b's', b'\r', PREFIX, b'd', b'z']);
        assert_eq!(fwd, b"ls\r");
        // Detach wins; anything after the chord is dropped with it.
        assert!(detach);
    }
}
