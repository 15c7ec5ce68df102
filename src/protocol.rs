//! Framed binary protocol shared by the daemon and its clients.
//!
//! Every message is a fixed 8-byte header — message type (u32, big-endian)
//! then payload length (u32, big-endian) — followed by the payload. Payload
//! fields are big-endian throughout; names and error strings are
//! length-prefixed UTF-8.
//!
//! The codec is stateless: [`MuxCodec`] consumes nothing until a whole frame
//! is buffered, so decoding a byte stream split at arbitrary boundaries
//! yields the same messages as decoding it in one shot. Unknown message
//! types and truncated payloads fail decoding loudly instead of being
//! skipped.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Fixed frame header size: type (u32) + payload length (u32).
pub const HEADER_LEN: usize = 8;

/// Upper bound on a single payload. Nothing the multiplexer sends comes
/// close; a larger length field means a corrupt or hostile peer.
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

mod kind {
    pub const IDENTIFY: u32 = 0;
    pub const NEW_SESSION: u32 = 1;
    pub const ATTACH: u32 = 2;
    pub const DETACH: u32 = 3;
    pub const LIST_SESSIONS: u32 = 4;
    pub const RESIZE: u32 = 5;
    pub const INPUT: u32 = 6;
    pub const OUTPUT: u32 = 7;
    pub const ERROR: u32 = 8;
    pub const SESSION_INFO: u32 = 9;
    pub const SHELL_EXITED: u32 = 10;
    pub const KILL_SESSION: u32 = 11;
}

/// Errors produced while encoding or decoding frames.
///
/// "Not enough bytes buffered yet" is not an error — the decoder returns
/// `Ok(None)` for that case.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown message type {0}")]
    UnknownType(u32),

    #[error("payload of {0} bytes exceeds frame limit")]
    Oversize(u32),

    #[error("truncated or malformed {kind} payload")]
    BadPayload { kind: &'static str },

    #[error("invalid UTF-8 in {kind} payload")]
    Utf8 { kind: &'static str },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Session metadata carried by SESSION_INFO frames.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub session_id: u32,
    pub name: String,
    pub pane_id: u32,
    pub pid: u32,
    pub cols: u16,
    pub rows: u16,
    /// Creation time as wall-clock seconds (IEEE-754 f64 on the wire).
    pub created_at: f64,
    pub attached: u32,
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// client → daemon: declared terminal dimensions.
    Identify { cols: u16, rows: u16 },
    /// client → daemon: create a session (empty name = default-name policy).
    NewSession { name: String },
    /// client → daemon: attach to a session by id.
    Attach { session_id: u32 },
    /// client → daemon: detach from the current session.
    Detach,
    /// client → daemon: request one SESSION_INFO per session.
    ListSessions,
    /// client → daemon: new terminal dimensions.
    Resize { cols: u16, rows: u16 },
    /// client → daemon: raw keystrokes for the active pane.
    Input(Bytes),
    /// daemon → client: raw pane output.
    Output(Bytes),
    /// daemon → client: an operation failed.
    Error { message: String },
    /// daemon → client: session metadata reply.
    SessionInfo(SessionInfo),
    /// daemon → client: the pane's shell reached end-of-stream.
    ShellExited { session_id: u32, pane_id: u32 },
    /// client → daemon: destroy a session by id.
    KillSession { session_id: u32 },
}

impl Message {
    /// Wire discriminant for the frame header.
    pub fn kind(&self) -> u32 {
        match self {
            Message::Identify { .. } => kind::IDENTIFY,
            Message::NewSession { .. } => kind::NEW_SESSION,
            Message::Attach { .. } => kind::ATTACH,
            Message::Detach => kind::DETACH,
            Message::ListSessions => kind::LIST_SESSIONS,
            Message::Resize { .. } => kind::RESIZE,
            Message::Input(_) => kind::INPUT,
            Message::Output(_) => kind::OUTPUT,
            Message::Error { .. } => kind::ERROR,
            Message::SessionInfo(_) => kind::SESSION_INFO,
            Message::ShellExited { .. } => kind::SHELL_EXITED,
            Message::KillSession { .. } => kind::KILL_SESSION,
        }
    }

    /// Encode a full frame (header + payload) into a standalone buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        MuxCodec
            .encode(self.clone(), &mut buf)
            .expect("encoding into BytesMut cannot fail");
        buf.freeze()
    }

    fn encode_payload(&self, dst: &mut BytesMut) {
        match self {
            Message::Identify { cols, rows } | Message::Resize { cols, rows } => {
                dst.put_u16(*cols);
                dst.put_u16(*rows);
            }
            Message::NewSession { name } => {
                dst.put_u32(name.len() as u32);
                dst.put_slice(name.as_bytes());
            }
            Message::Attach { session_id } | Message::KillSession { session_id } => {
                dst.put_u32(*session_id);
            }
            Message::Detach | Message::ListSessions => {}
            Message::Input(data) | Message::Output(data) => {
                dst.put_slice(data);
            }
            Message::Error { message } => {
                dst.put_u32(message.len() as u32);
                dst.put_slice(message.as_bytes());
            }
            Message::SessionInfo(info) => {
                dst.put_u32(info.session_id);
                dst.put_u32(info.name.len() as u32);
                dst.put_slice(info.name.as_bytes());
                dst.put_u32(info.pane_id);
                dst.put_u32(info.pid);
                dst.put_u16(info.cols);
                dst.put_u16(info.rows);
                dst.put_f64(info.created_at);
                dst.put_u32(info.attached);
            }
            Message::ShellExited {
                session_id,
                pane_id,
            } => {
                dst.put_u32(*session_id);
                dst.put_u32(*pane_id);
            }
        }
    }

    fn parse(type_id: u32, mut payload: Bytes) -> Result<Self, ProtocolError> {
        match type_id {
            kind::IDENTIFY => {
                let (cols, rows) = parse_dimensions("IDENTIFY", &mut payload)?;
                Ok(Message::Identify { cols, rows })
            }
            kind::NEW_SESSION => Ok(Message::NewSession {
                name: parse_string("NEW_SESSION", &mut payload)?,
            }),
            kind::ATTACH => Ok(Message::Attach {
                session_id: parse_u32("ATTACH", &mut payload)?,
            }),
            kind::DETACH => Ok(Message::Detach),
            kind::LIST_SESSIONS => Ok(Message::ListSessions),
            kind::RESIZE => {
                let (cols, rows) = parse_dimensions("RESIZE", &mut payload)?;
                Ok(Message::Resize { cols, rows })
            }
            kind::INPUT => Ok(Message::Input(payload)),
            kind::OUTPUT => Ok(Message::Output(payload)),
            kind::ERROR => Ok(Message::Error {
                message: parse_string("ERROR", &mut payload)?,
            }),
            kind::SESSION_INFO => {
                let session_id = parse_u32("SESSION_INFO", &mut payload)?;
                let name = parse_string_prefix("SESSION_INFO", &mut payload)?;
                if payload.remaining() != 4 + 4 + 4 + 8 + 4 {
                    return Err(ProtocolError::BadPayload {
                        kind: "SESSION_INFO",
                    });
                }
                let pane_id = payload.get_u32();
                let pid = payload.get_u32();
                let cols = payload.get_u16();
                let rows = payload.get_u16();
                let created_at = payload.get_f64();
                let attached = payload.get_u32();
                Ok(Message::SessionInfo(SessionInfo {
                    session_id,
                    name,
                    pane_id,
                    pid,
                    cols,
                    rows,
                    created_at,
                    attached,
                }))
            }
            kind::SHELL_EXITED => {
                if payload.remaining() != 8 {
                    return Err(ProtocolError::BadPayload {
                        kind: "SHELL_EXITED",
                    });
                }
                Ok(Message::ShellExited {
                    session_id: payload.get_u32(),
                    pane_id: payload.get_u32(),
                })
            }
            kind::KILL_SESSION => Ok(Message::KillSession {
                session_id: parse_u32("KILL_SESSION", &mut payload)?,
            }),
            other => Err(ProtocolError::UnknownType(other)),
        }
    }
}

/// Exactly `cols (u16) + rows (u16)`.
fn parse_dimensions(kind: &'static str, payload: &mut Bytes) -> Result<(u16, u16), ProtocolError> {
    if payload.remaining() != 4 {
        return Err(ProtocolError::BadPayload { kind });
    }
    Ok((payload.get_u16(), payload.get_u16()))
}

/// Exactly one u32.
fn parse_u32(kind: &'static str, payload: &mut Bytes) -> Result<u32, ProtocolError> {
    if payload.remaining() != 4 {
        return Err(ProtocolError::BadPayload { kind });
    }
    Ok(payload.get_u32())
}

/// A length-prefixed UTF-8 string consuming the whole remaining payload.
fn parse_string(kind: &'static str, payload: &mut Bytes) -> Result<String, ProtocolError> {
    let s = parse_string_prefix(kind, payload)?;
    if payload.has_remaining() {
        return Err(ProtocolError::BadPayload { kind });
    }
    Ok(s)
}

/// A length-prefixed UTF-8 string, leaving any trailing bytes in `payload`.
fn parse_string_prefix(kind: &'static str, payload: &mut Bytes) -> Result<String, ProtocolError> {
    if payload.remaining() < 4 {
        return Err(ProtocolError::BadPayload { kind });
    }
    let len = payload.get_u32() as usize;
    if payload.remaining() < len {
        return Err(ProtocolError::BadPayload { kind });
    }
    let raw = payload.copy_to_bytes(len);
    String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::Utf8 { kind })
}

/// Length-prefixed frame codec for [`Message`], usable on both ends of the
/// socket via `tokio_util::codec::Framed`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MuxCodec;

impl Decoder for MuxCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let mut header = &src[..HEADER_LEN];
        let type_id = header.get_u32();
        let payload_len = header.get_u32();
        if payload_len as usize > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::Oversize(payload_len));
        }
        let frame_len = HEADER_LEN + payload_len as usize;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }
        src.advance(HEADER_LEN);
        let payload = src.split_to(payload_len as usize).freeze();
        Message::parse(type_id, payload).map(Some)
    }
}

impl Encoder<Message> for MuxCodec {
    type Error = ProtocolError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let mut payload = BytesMut::new();
        msg.encode_payload(&mut payload);
        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u32(msg.kind());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: &Message) -> Message {
        let mut buf = BytesMut::from(&msg.to_bytes()[..]);
        let decoded = MuxCodec
            .decode(&mut buf)
            .expect("decode failed")
            .expect("incomplete frame");
        assert!(buf.is_empty(), "decoder left bytes behind");
        decoded
    }

    fn sample_info() -> SessionInfo {
        SessionInfo {
            session_id: 3,
            name: "work".to_string(),
            pane_id: 7,
            pid: 4_294_901_760,
            cols: 120,
            rows: 40,
            created_at: 1_717_171_717.25,
            attached: 2,
        }
    }

    #[test]
    fn every_message_roundtrips() {
        let messages = vec![
            Message::Identify {
                cols: 80,
                rows: 24,
            },
            Message::NewSession {
                name: "main".to_string(),
            },
            Message::Attach { session_id: 42 },
            Message::Detach,
            Message::ListSessions,
            Message::Resize {
                cols: 65_535,
                rows: 65_535,
            },
            Message::Input(Bytes::from_static(b"echo hello\n")),
            Message::Output(Bytes::from_static(b"hello\r\n")),
            Message::Error {
                message: "session 9 not found".to_string(),
            },
            Message::SessionInfo(sample_info()),
            Message::ShellExited {
                session_id: 1,
                pane_id: 2,
            },
            Message::KillSession { session_id: 0 },
        ];
        for msg in messages {
            assert_eq!(roundtrip(&msg), msg);
        }
    }

    #[test]
    fn unicode_session_name_roundtrips() {
        let msg = Message::NewSession {
            name: "séance-日本語-🦀".to_string(),
        };
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn binary_payloads_are_byte_safe() {
        let all: Vec<u8> = (0..=255u8).collect();
        let input = Message::Input(Bytes::from(all.clone()));
        match roundtrip(&input) {
            Message::Input(data) => assert_eq!(&data[..], &all[..]),
            other => panic!("unexpected {other:?}"),
        }
        let output = Message::Output(Bytes::from(all.clone()));
        match roundtrip(&output) {
            Message::Output(data) => assert_eq!(&data[..], &all[..]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn empty_error_and_empty_input() {
        assert_eq!(
            roundtrip(&Message::Error {
                message: String::new()
            }),
            Message::Error {
                message: String::new()
            }
        );
        assert_eq!(
            roundtrip(&Message::Input(Bytes::new())),
            Message::Input(Bytes::new())
        );
    }

    #[test]
    fn partial_header_consumes_nothing() {
        let frame = Message::Detach.to_bytes();
        let mut buf = BytesMut::from(&frame[..HEADER_LEN - 1]);
        assert!(MuxCodec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), HEADER_LEN - 1);
    }

    #[test]
    fn partial_payload_consumes_nothing() {
        let frame = Message::NewSession {
            name: "work".to_string(),
        }
        .to_bytes();
        let mut buf = BytesMut::from(&frame[..frame.len() - 1]);
        assert!(MuxCodec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), frame.len() - 1);
    }

    #[test]
    fn streaming_split_matches_one_shot() {
        let frame = Message::SessionInfo(sample_info()).to_bytes();
        // Feed the frame one byte at a time; the message must appear exactly
        // once, at the final byte.
        for split in 1..frame.len() {
            let mut buf = BytesMut::from(&frame[..split]);
            assert!(
                MuxCodec.decode(&mut buf).unwrap().is_none(),
                "decoded early at split {split}"
            );
            buf.extend_from_slice(&frame[split..]);
            let decoded = MuxCodec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, Message::SessionInfo(sample_info()));
        }
    }

    #[test]
    fn multiple_messages_in_one_buffer() {
        let mut buf = BytesMut::new();
        let messages = [
            Message::Identify {
                cols: 80,
                rows: 24,
            },
            Message::Input(Bytes::from_static(b"ls\n")),
            Message::Detach,
        ];
        for msg in &messages {
            buf.extend_from_slice(&msg.to_bytes());
        }
        // Trailing partial frame must stay in the buffer.
        let trailing = Message::ListSessions.to_bytes();
        buf.extend_from_slice(&trailing[..4]);

        for msg in &messages {
            assert_eq!(&MuxCodec.decode(&mut buf).unwrap().unwrap(), msg);
        }
        assert!(MuxCodec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn unknown_message_type_fails() {
        let mut buf = BytesMut::new();
        buf.put_u32(99);
        buf.put_u32(0);
        assert!(matches!(
            MuxCodec.decode(&mut buf),
            Err(ProtocolError::UnknownType(99))
        ));
    }

    #[test]
    fn truncated_payloads_fail() {
        // IDENTIFY with 2 bytes instead of 4.
        let mut buf = BytesMut::new();
        buf.put_u32(0);
        buf.put_u32(2);
        buf.put_u16(80);
        assert!(matches!(
            MuxCodec.decode(&mut buf),
            Err(ProtocolError::BadPayload { kind: "IDENTIFY" })
        ));

        // NEW_SESSION whose declared name length exceeds the payload.
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u32(6);
        buf.put_u32(100);
        buf.put_u16(0);
        assert!(matches!(
            MuxCodec.decode(&mut buf),
            Err(ProtocolError::BadPayload {
                kind: "NEW_SESSION"
            })
        ));
    }

    #[test]
    fn invalid_utf8_name_fails() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u32(8);
        buf.put_u32(4);
        buf.put_slice(&[0xff, 0xfe, 0xfd, 0xfc]);
        assert!(matches!(
            MuxCodec.decode(&mut buf),
            Err(ProtocolError::Utf8 {
                kind: "NEW_SESSION"
            })
        ));
    }

    #[test]
    fn oversize_length_field_fails() {
        let mut buf = BytesMut::new();
        buf.put_u32(6);
        buf.put_u32(u32::MAX);
        assert!(matches!(
            MuxCodec.decode(&mut buf),
            Err(ProtocolError::Oversize(_))
        ));
    }
}
