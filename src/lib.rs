#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]

//! rmux library — the building blocks of the terminal multiplexer.
//!
//! - `protocol` — the framed binary message set shared by daemon and clients
//! - `pty` — PTY allocation, shell spawning, resize
//! - `term` — the VT screen emulator backing each pane
//! - `sessions` — the session/pane registry and the per-session output pump
//! - `daemon` — Unix-socket server, connection handling, lifecycle
//! - `client` — RPC helpers and the interactive attach client
//! - `config` — configuration loading
//! - `paths` — socket and PID-file path policy

pub mod client;
pub mod config;
pub mod daemon;
pub mod error;
pub mod paths;
pub mod protocol;
pub mod pty;
pub mod sessions;
pub mod term;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use error::RegistryError;
pub use protocol::{Message, MuxCodec};
pub use sessions::{Registry, SessionRef};
