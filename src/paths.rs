//! Socket and PID-file path policy.
//!
//! The daemon and every client must agree on where the socket lives. The
//! path is derived from the environment and the invoking user's uid, never
//! from configuration, so that independently started processes meet at the
//! same rendezvous point.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Environment override for the socket directory.
pub const SOCKET_DIR_ENV: &str = "RMUX_TMPDIR";

/// Resolve the Unix-socket path.
///
/// `$RMUX_TMPDIR/default` when the override is set and non-empty, otherwise
/// `/tmp/rmux-<uid>/default`. The parent directory is created by the daemon
/// with mode 0700.
pub fn socket_path() -> PathBuf {
    if let Ok(dir) = std::env::var(SOCKET_DIR_ENV) {
        if !dir.is_empty() {
            return PathBuf::from(dir).join("default");
        }
    }
    let uid = nix::unistd::Uid::current();
    PathBuf::from(format!("/tmp/rmux-{uid}")).join("default")
}

/// PID-file path for a given socket path: the socket path with a `.pid`
/// suffix appended (not an extension swap — `default` has no extension).
pub fn pid_file_path(socket: &Path) -> PathBuf {
    let mut s = OsString::from(socket.as_os_str());
    s.push(".pid");
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_file_appends_suffix() {
        let pid = pid_file_path(Path::new("/tmp/rmux-1000/default"));
        assert_eq!(pid, PathBuf::from("/tmp/rmux-1000/default.pid"));
    }

    #[test]
    fn socket_path_honors_env_override() {
        // Set + unset in one test so parallel tests never observe the
        // override.
        std::env::set_var(SOCKET_DIR_ENV, "/tmp/rmux-test-override");
        let path = socket_path();
        std::env::remove_var(SOCKET_DIR_ENV);
        assert_eq!(path, PathBuf::from("/tmp/rmux-test-override/default"));

        let default = socket_path();
        let uid = nix::unistd::Uid::current();
        assert_eq!(default, PathBuf::from(format!("/tmp/rmux-{uid}/default")));
    }
}
