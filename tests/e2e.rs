//! End-to-end scenarios against a real daemon on a tempdir socket.
//!
//! Each test boots its own daemon task with its own socket, talks to it with
//! raw framed connections (no CLI in between), and spawns real `/bin/sh`
//! children. Assertions poll with deadlines rather than sleeping fixed
//! amounts, so slow machines pass and fast machines stay fast.

use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio_util::codec::Framed;

use rmux::protocol::{Message, MuxCodec, SessionInfo};
use rmux::{daemon, Config};

type Client = Framed<UnixStream, MuxCodec>;

struct TestDaemon {
    // Kept alive for the test duration; the socket lives inside it.
    _dir: tempfile::TempDir,
    socket: PathBuf,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn start_daemon() -> TestDaemon {
    let dir = tempfile::tempdir().expect("tempdir");
    let socket = dir.path().join("default");
    let path = socket.clone();
    let task = tokio::spawn(async move {
        let _ = daemon::serve(&path, Config::default()).await;
    });

    for _ in 0..250 {
        if UnixStream::connect(&socket).await.is_ok() {
            return TestDaemon {
                _dir: dir,
                socket,
                task,
            };
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("daemon did not come up");
}

async fn connect(socket: &PathBuf, cols: u16, rows: u16) -> Client {
    let stream = UnixStream::connect(socket).await.expect("connect");
    let mut client = Framed::new(stream, MuxCodec);
    client
        .send(Message::Identify { cols, rows })
        .await
        .expect("identify");
    client
}

async fn next_frame(client: &mut Client, timeout: Duration) -> Option<Message> {
    match tokio::time::timeout(timeout, client.next()).await {
        Ok(Some(Ok(msg))) => Some(msg),
        _ => None,
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Accumulate OUTPUT payloads until `needle` shows up or the deadline ends.
async fn read_output_until(client: &mut Client, needle: &[u8], deadline: Duration) -> Vec<u8> {
    let mut collected = Vec::new();
    let end = tokio::time::Instant::now() + deadline;
    while tokio::time::Instant::now() < end && !contains(&collected, needle) {
        match tokio::time::timeout(Duration::from_millis(250), client.next()).await {
            Ok(Some(Ok(Message::Output(data)))) => collected.extend_from_slice(&data),
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(_))) | Ok(None) => break,
            Err(_) => {}
        }
    }
    collected
}

async fn new_session(client: &mut Client, name: &str) -> SessionInfo {
    client
        .send(Message::NewSession {
            name: name.to_string(),
        })
        .await
        .expect("send new_session");
    // The reply is enqueued before the pump starts, so it beats any prompt
    // output.
    match next_frame(client, Duration::from_secs(5)).await {
        Some(Message::SessionInfo(info)) => info,
        other => panic!("expected SESSION_INFO, got {other:?}"),
    }
}

async fn send_input(client: &mut Client, line: &str) {
    client
        .send(Message::Input(Bytes::from(line.as_bytes().to_vec())))
        .await
        .expect("send input");
}

// S1: echo round-trip through a fresh default-named session.
#[tokio::test]
async fn echo_round_trip() {
    let d = start_daemon().await;
    let mut c = connect(&d.socket, 80, 24).await;

    let info = new_session(&mut c, "").await;
    assert_eq!(info.name, "main");
    assert_eq!(info.session_id, 0);
    assert_eq!((info.cols, info.rows), (80, 24));
    assert_eq!(info.attached, 1);
    assert!(info.pid > 0);

    send_input(&mut c, "echo hello_roundtrip_91\n").await;
    let out = read_output_until(&mut c, b"hello_roundtrip_91", Duration::from_secs(10)).await;
    assert!(
        contains(&out, b"hello_roundtrip_91"),
        "missing echo in: {}",
        String::from_utf8_lossy(&out)
    );
}

// S2: RESIZE reaches the shell's tty.
#[tokio::test]
async fn resize_propagates_to_the_shell() {
    let d = start_daemon().await;
    let mut c = connect(&d.socket, 80, 24).await;
    let _info = new_session(&mut c, "resize-me").await;

    c.send(Message::Resize {
        cols: 120,
        rows: 40,
    })
    .await
    .unwrap();
    // Give the ioctl a moment, then ask the shell what it sees.
    tokio::time::sleep(Duration::from_millis(200)).await;
    send_input(&mut c, "stty size\n").await;

    let out = read_output_until(&mut c, b"40 120", Duration::from_secs(10)).await;
    assert!(contains(&out, b"40"), "{}", String::from_utf8_lossy(&out));
    assert!(contains(&out, b"120"), "{}", String::from_utf8_lossy(&out));
}

// S3: detach, reattach from a second client, replay precedes SESSION_INFO.
#[tokio::test]
async fn reattach_replays_screen_state() {
    let d = start_daemon().await;

    let mut a = connect(&d.socket, 80, 24).await;
    let info = new_session(&mut a, "work").await;
    send_input(&mut a, "echo replay_marker_12345\n").await;
    // Seeing the marker on A means the pump fed the emulator first.
    let seen = read_output_until(&mut a, b"replay_marker_12345", Duration::from_secs(10)).await;
    assert!(contains(&seen, b"replay_marker_12345"));
    drop(a);

    let mut b = connect(&d.socket, 80, 24).await;
    b.send(Message::Attach {
        session_id: info.session_id,
    })
    .await
    .unwrap();

    let first = next_frame(&mut b, Duration::from_secs(5)).await;
    let Some(Message::Output(replay)) = first else {
        panic!("expected replay OUTPUT first, got {first:?}");
    };
    assert!(
        contains(&replay, b"replay_marker_12345"),
        "replay missing marker: {}",
        String::from_utf8_lossy(&replay)
    );

    let second = next_frame(&mut b, Duration::from_secs(5)).await;
    let Some(Message::SessionInfo(info2)) = second else {
        panic!("expected SESSION_INFO second, got {second:?}");
    };
    assert_eq!(info2.session_id, info.session_id);
    assert_eq!(info2.attached, 1);
}

// S4: output fans out to every attached client.
#[tokio::test]
async fn output_is_shared_across_clients() {
    let d = start_daemon().await;

    let mut a = connect(&d.socket, 80, 24).await;
    let info = new_session(&mut a, "shared").await;

    let mut b = connect(&d.socket, 80, 24).await;
    b.send(Message::Attach {
        session_id: info.session_id,
    })
    .await
    .unwrap();
    // Drain B's replay + info before the live test.
    let Some(Message::Output(_)) = next_frame(&mut b, Duration::from_secs(5)).await else {
        panic!("expected replay");
    };
    let Some(Message::SessionInfo(_)) = next_frame(&mut b, Duration::from_secs(5)).await else {
        panic!("expected info");
    };

    send_input(&mut a, "echo shared_output_77\n").await;
    let out_b = read_output_until(&mut b, b"shared_output_77", Duration::from_secs(10)).await;
    assert!(
        contains(&out_b, b"shared_output_77"),
        "B missed the broadcast: {}",
        String::from_utf8_lossy(&out_b)
    );
}

// S5: scrollback is replayed on attach, oldest first.
#[tokio::test]
async fn scrollback_replays_in_order() {
    let d = start_daemon().await;

    let mut a = connect(&d.socket, 80, 24).await;
    let info = new_session(&mut a, "scroll").await;
    // 30 numbered lines on a 24-row screen pushes the early ones into
    // scrollback. Plain sh builtins, no seq dependency.
    send_input(
        &mut a,
        "i=0; while [ $i -lt 30 ]; do printf 'SCROLLBACK_LINE_%02d\\n' $i; i=$((i+1)); done\n",
    )
    .await;
    let seen = read_output_until(&mut a, b"SCROLLBACK_LINE_29", Duration::from_secs(10)).await;
    assert!(contains(&seen, b"SCROLLBACK_LINE_29"));
    drop(a);

    let mut b = connect(&d.socket, 80, 24).await;
    b.send(Message::Attach {
        session_id: info.session_id,
    })
    .await
    .unwrap();

    let mut replay = Vec::new();
    loop {
        match next_frame(&mut b, Duration::from_secs(5)).await {
            Some(Message::Output(data)) => replay.extend_from_slice(&data),
            Some(Message::SessionInfo(_)) => break,
            other => panic!("unexpected frame during replay: {other:?}"),
        }
    }
    let text = String::from_utf8_lossy(&replay).to_string();
    let first = text
        .find("SCROLLBACK_LINE_00")
        .unwrap_or_else(|| panic!("line 00 missing from replay: {text}"));
    let last = text
        .find("SCROLLBACK_LINE_29")
        .unwrap_or_else(|| panic!("line 29 missing from replay: {text}"));
    assert!(first < last, "scrollback out of order");
}

// S6: kill-session removes one session, leaves the other, reaps the child.
#[tokio::test]
async fn kill_session_destroys_exactly_one() {
    let d = start_daemon().await;

    let mut a = connect(&d.socket, 80, 24).await;
    let first = new_session(&mut a, "first").await;
    let mut b = connect(&d.socket, 80, 24).await;
    let second = new_session(&mut b, "second").await;

    a.send(Message::KillSession {
        session_id: first.session_id,
    })
    .await
    .unwrap();

    // The listing settles to just the survivor.
    let mut c = connect(&d.socket, 80, 24).await;
    c.send(Message::ListSessions).await.unwrap();
    let mut listed = Vec::new();
    while let Some(Message::SessionInfo(info)) = next_frame(&mut c, Duration::from_secs(1)).await {
        listed.push(info);
    }
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].session_id, second.session_id);
    assert_eq!(listed[0].name, "second");

    // ATTACH to the dead id answers with ERROR.
    let mut e = connect(&d.socket, 80, 24).await;
    e.send(Message::Attach {
        session_id: first.session_id,
    })
    .await
    .unwrap();
    match next_frame(&mut e, Duration::from_secs(5)).await {
        Some(Message::Error { message }) => assert!(message.contains("not found")),
        other => panic!("expected ERROR, got {other:?}"),
    }

    // The first session's shell is gone (reaped, not a zombie).
    let pid = nix::unistd::Pid::from_raw(first.pid as i32);
    let end = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        match nix::sys::signal::kill(pid, None) {
            Err(nix::errno::Errno::ESRCH) => break,
            _ if tokio::time::Instant::now() > end => panic!("pid {pid} still alive"),
            _ => tokio::time::sleep(Duration::from_millis(100)).await,
        }
    }
}

// Attaching to a session whose shell exited gets SHELL_EXITED, no replay.
#[tokio::test]
async fn attach_to_dead_pane_reports_exit() {
    let d = start_daemon().await;

    let mut a = connect(&d.socket, 80, 24).await;
    let info = new_session(&mut a, "mortal").await;
    send_input(&mut a, "exit\n").await;

    // The creator hears about the exit.
    let end = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        match next_frame(&mut a, Duration::from_millis(500)).await {
            Some(Message::ShellExited {
                session_id,
                pane_id,
            }) => {
                assert_eq!(session_id, info.session_id);
                assert_eq!(pane_id, info.pane_id);
                break;
            }
            Some(Message::Output(_)) | None => {
                assert!(
                    tokio::time::Instant::now() < end,
                    "no SHELL_EXITED within deadline"
                );
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
    drop(a);

    // A later attach is answered immediately, without a snapshot.
    let mut b = connect(&d.socket, 80, 24).await;
    b.send(Message::Attach {
        session_id: info.session_id,
    })
    .await
    .unwrap();
    match next_frame(&mut b, Duration::from_secs(5)).await {
        Some(Message::ShellExited { session_id, .. }) => {
            assert_eq!(session_id, info.session_id);
        }
        other => panic!("expected SHELL_EXITED, got {other:?}"),
    }
}

// Protocol misuse: INPUT without attachment draws an ERROR frame.
#[tokio::test]
async fn input_without_attachment_is_an_error() {
    let d = start_daemon().await;
    let mut c = connect(&d.socket, 80, 24).await;
    c.send(Message::Input(Bytes::from_static(b"ls\n")))
        .await
        .unwrap();
    match next_frame(&mut c, Duration::from_secs(5)).await {
        Some(Message::Error { message }) => {
            assert!(message.contains("not attached"), "{message}");
        }
        other => panic!("expected ERROR, got {other:?}"),
    }
}

// Daemon-bound frame types that only the daemon may send are rejected
// without dropping the connection.
#[tokio::test]
async fn reply_frames_from_clients_are_rejected_softly() {
    let d = start_daemon().await;
    let mut c = connect(&d.socket, 80, 24).await;
    c.send(Message::Output(Bytes::from_static(b"nope")))
        .await
        .unwrap();
    match next_frame(&mut c, Duration::from_secs(5)).await {
        Some(Message::Error { message }) => {
            assert!(message.contains("unhandled"), "{message}");
        }
        other => panic!("expected ERROR, got {other:?}"),
    }
    // Connection still usable afterwards.
    c.send(Message::ListSessions).await.unwrap();
    assert!(next_frame(&mut c, Duration::from_secs(1)).await.is_none());
}

// Duplicate session names are refused with an ERROR.
#[tokio::test]
async fn duplicate_session_name_is_refused() {
    let d = start_daemon().await;
    let mut a = connect(&d.socket, 80, 24).await;
    let _ = new_session(&mut a, "taken").await;

    let mut b = connect(&d.socket, 80, 24).await;
    b.send(Message::NewSession {
        name: "taken".to_string(),
    })
    .await
    .unwrap();
    match next_frame(&mut b, Duration::from_secs(5)).await {
        Some(Message::Error { message }) => {
            assert!(message.contains("already in use"), "{message}");
        }
        other => panic!("expected ERROR, got {other:?}"),
    }
}
