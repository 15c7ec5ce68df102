//! Daemon lifecycle: socket setup, signal handling, accept loop, shutdown.
//!
//! Startup order matters: the socket directory is created 0700 and any stale
//! socket unlinked before binding, the socket itself is chmod'd 0600 so only
//! the owning user can attach, and only then does the accept loop start.
//!
//! Shutdown order matters more: children are SIGKILLed first and given a
//! short grace period, *then* the pumps are cancelled and the sessions
//! destroyed. Killing first keeps a pump from racing a live child that has
//! not yet seen its signal.

pub mod conn;
mod daemonize;

pub use daemonize::daemonize;

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tokio::net::UnixListener;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use crate::config::Config;
use crate::paths;
use crate::sessions::{Shared, SharedState};

/// Bind the socket and serve until SIGTERM or Ctrl-C.
///
/// On return the socket and PID file are gone, every child shell has been
/// killed and reaped, and every pump cancelled.
pub async fn serve(socket_path: &Path, config: Config) -> std::io::Result<()> {
    if let Some(dir) = socket_path.parent() {
        std::fs::create_dir_all(dir)?;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    }
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }

    let listener = UnixListener::bind(socket_path)?;
    std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
    info!(
        "rmux v{} listening on {}",
        env!("CARGO_PKG_VERSION"),
        socket_path.display()
    );

    // The socket now belongs to this process; arm the exit hook so the
    // on-disk artifacts disappear even when the graceful path never runs.
    register_exit_cleanup(socket_path);

    let shared = Shared::new(config.server.scrollback_lines);
    let config = Arc::new(config);

    // SIGCHLD → drain every zombie, recording exit codes against panes.
    let mut sigchld = signal(SignalKind::child())?;
    let reap_state = shared.clone();
    let reaper = tokio::spawn(async move {
        while sigchld.recv().await.is_some() {
            reap_children(&reap_state).await;
        }
    });

    // SIGHUP is noise for a daemon with no config reload: swallow it.
    let mut sighup = signal(SignalKind::hangup())?;
    let hup_task = tokio::spawn(async move { while sighup.recv().await.is_some() {} });

    let mut sigterm = signal(SignalKind::terminate())?;

    let mut next_client_id: u64 = 0;
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let client_id = next_client_id;
                        next_client_id += 1;
                        tokio::spawn(conn::handle_client(
                            stream,
                            client_id,
                            shared.clone(),
                            Arc::clone(&config),
                        ));
                    }
                    Err(e) => warn!("accept failed: {e}"),
                }
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                break;
            }
        }
    }

    drop(listener);
    reaper.abort();
    hup_task.abort();
    shutdown(&shared).await;
    cleanup_files(socket_path);
    info!("goodbye");
    Ok(())
}

/// Non-blocking reap loop for SIGCHLD: collect every terminated child and
/// record its status on the owning pane.
async fn reap_children(shared: &SharedState) {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, code)) => {
                shared
                    .write()
                    .await
                    .registry
                    .record_exit(pid.as_raw() as u32, code);
            }
            Ok(WaitStatus::Signaled(pid, sig, _)) => {
                shared
                    .write()
                    .await
                    .registry
                    .record_exit(pid.as_raw() as u32, 128 + sig as i32);
            }
            // StillAlive, stop/continue events, or ECHILD: nothing to drain.
            Ok(_) | Err(_) => break,
        }
    }
}

/// Graceful teardown of everything the daemon owns.
pub async fn shutdown(shared: &SharedState) {
    // 1. Kill every child shell.
    {
        let st = shared.read().await;
        for session_id in st.registry.session_ids() {
            if let Some(session) = st.registry.session(session_id) {
                for pane in session.panes.values() {
                    pane.kill();
                }
            }
        }
    }

    // 2. Give the kernel a beat to deliver the signals before the pumps go.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let mut st = shared.write().await;
    // 3. Cancel every pump.
    for (_, handle) in st.pumps.drain() {
        handle.abort();
    }
    // 4. Destroy sessions — closes PTY fds and reaps stragglers.
    for session_id in st.registry.session_ids() {
        let _ = st.registry.destroy_session(session_id);
    }
    // 5. Close every client writer.
    st.clients.clear();
    info!("shutdown complete");
}

fn cleanup_files(socket_path: &Path) {
    let _ = std::fs::remove_file(socket_path);
    let _ = std::fs::remove_file(paths::pid_file_path(socket_path));
}

/// Artifact paths for the exit hook; set once when the daemon binds.
static EXIT_ARTIFACTS: OnceLock<(PathBuf, PathBuf)> = OnceLock::new();

fn remove_exit_artifacts() {
    if let Some((socket, pid_file)) = EXIT_ARTIFACTS.get() {
        let _ = std::fs::remove_file(socket);
        let _ = std::fs::remove_file(pid_file);
    }
}

extern "C" fn remove_exit_artifacts_at_exit() {
    remove_exit_artifacts();
}

/// Belt-and-suspenders removal of the socket and PID file, independent of
/// the `serve` return path: a `libc::atexit` handler covers
/// `std::process::exit` from anywhere in the daemon, and a chained panic
/// hook covers a panic unwinding the main thread. Worker-task panics are
/// caught by the runtime and leave the daemon serving, so the panic hook
/// must not unlink a live socket for those.
fn register_exit_cleanup(socket_path: &Path) {
    let artifacts = (
        socket_path.to_path_buf(),
        paths::pid_file_path(socket_path),
    );
    if EXIT_ARTIFACTS.set(artifacts).is_err() {
        // Already armed (tests may boot several daemons in one process).
        return;
    }

    // SAFETY: registers a C callback that only unlinks two files.
    unsafe {
        libc::atexit(remove_exit_artifacts_at_exit);
    }

    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        if std::thread::current().name() == Some("main") {
            remove_exit_artifacts();
        }
        previous(info);
    }));
}
