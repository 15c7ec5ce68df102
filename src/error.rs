//! Error types shared across the daemon.
//!
//! The protocol codec has its own error type in [`crate::protocol`]; this
//! module covers the registry and the PTY layer. Connection-level dispatch
//! errors are rendered into ERROR frames by the connection handler and never
//! bring the daemon down.

use thiserror::Error;

/// Errors from [`crate::sessions::Registry`] operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// NEW_SESSION with a name that is already taken.
    #[error("session name '{0}' already in use")]
    NameInUse(String),

    /// Operation on a session id/name the registry does not know.
    #[error("session {0} not found")]
    SessionNotFound(String),

    /// Operation on a pane id the session does not contain.
    #[error("pane {pane} not found in session {session}")]
    PaneNotFound { session: u32, pane: u32 },

    /// Destroying the last pane of a session is only allowed via
    /// `destroy_session`.
    #[error("cannot destroy the last pane of session {0}")]
    LastPane(u32),

    #[error(transparent)]
    Pty(#[from] PtyError),
}

/// Errors from the PTY adapter.
#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed to allocate PTY: {0}")]
    Allocate(#[source] nix::Error),

    #[error("failed to spawn shell '{shell}': {source}")]
    Spawn {
        shell: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to resize PTY: {0}")]
    Resize(#[source] nix::Error),

    #[error("failed to duplicate PTY master fd: {0}")]
    CloneFd(#[source] std::io::Error),

    #[error("pane input channel closed")]
    InputClosed,
}
