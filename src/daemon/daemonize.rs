//! Double-fork daemonization.
//!
//! Must run before the tokio runtime boots: fork() and a live runtime do not
//! mix, which is why `main` builds its runtime by hand for the `server`
//! sub-command instead of using the macro.

use std::os::fd::AsRawFd;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use nix::unistd::{fork, setsid, ForkResult};

/// Detach from the controlling terminal and write the PID file.
///
/// Standard sequence: fork and exit the parent, `setsid()`, fork again so
/// the daemon can never reacquire a controlling terminal, point the three
/// standard streams at `/dev/null`, record the final pid.
pub fn daemonize(pid_file: &Path) -> std::io::Result<()> {
    if let Some(dir) = pid_file.parent() {
        std::fs::create_dir_all(dir)?;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    }

    // SAFETY: called from main before any threads (or the runtime) exist.
    match unsafe { fork() }.map_err(nix_to_io)? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    setsid().map_err(nix_to_io)?;

    match unsafe { fork() }.map_err(nix_to_io)? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    let null = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")?;
    let null_fd = null.as_raw_fd();
    // SAFETY: dup2 onto the standard descriptors; `null` closes its own fd
    // on drop, the duplicates stay.
    unsafe {
        libc::dup2(null_fd, 0);
        libc::dup2(null_fd, 1);
        libc::dup2(null_fd, 2);
    }
    drop(null);

    std::fs::write(pid_file, format!("{}\n", std::process::id()))?;
    Ok(())
}

fn nix_to_io(e: nix::Error) -> std::io::Error {
    std::io::Error::from_raw_os_error(e as i32)
}
