#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # rmux
//!
//! A minimal terminal multiplexer: a background daemon owns long-lived shell
//! sessions behind pseudo-terminals, and thin clients attach over a Unix
//! socket, replaying the pane's screen on attach and forwarding keystrokes
//! live. Detach with `Ctrl-b d`; the shell keeps running.
//!
//! ## Subcommands
//!
//! - `rmux` / `rmux new-session [-s NAME]` — create a session and attach
//! - `rmux attach-session [-t TARGET]` — attach to an existing session
//! - `rmux list-sessions` — tabular listing of all sessions
//! - `rmux kill-session -t TARGET` — destroy one session
//! - `rmux kill-server` — terminate the daemon
//! - `rmux server [--daemon]` — run the daemon (normally spawned on demand)

use clap::{Parser, Subcommand};

use rmux::client::attach::AttachTarget;
use rmux::client::{self, ClientError};
use rmux::protocol::SessionInfo;
use rmux::{daemon, paths, Config};

/// A minimal terminal multiplexer.
#[derive(Parser)]
#[command(name = "rmux", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new session and attach to it (the default command).
    #[command(visible_alias = "new")]
    NewSession {
        /// Session name (default: "main", then "session-<n>").
        #[arg(short = 's', long)]
        name: Option<String>,
    },
    /// Attach to an existing session.
    #[command(visible_aliases = ["attach", "a"])]
    AttachSession {
        /// Session name or id (defaults to the only session).
        #[arg(short = 't', long)]
        target: Option<String>,
    },
    /// List all sessions.
    #[command(visible_alias = "ls")]
    ListSessions,
    /// Kill a session.
    KillSession {
        /// Session name or id.
        #[arg(short = 't', long)]
        target: String,
    },
    /// Kill the server daemon.
    KillServer,
    /// Run the session server (normally started automatically).
    Server {
        /// Fork into the background and write a PID file.
        #[arg(long)]
        daemon: bool,
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Server { daemon, config }) => run_server(daemon, config.as_deref()),
        Some(Commands::NewSession { name }) => run_client(cmd_new_session(name)),
        Some(Commands::AttachSession { target }) => run_client(cmd_attach(target)),
        Some(Commands::ListSessions) => run_client(cmd_list_sessions()),
        Some(Commands::KillSession { target }) => run_client(cmd_kill_session(target)),
        Some(Commands::KillServer) => run_client(cmd_kill_server()),
        // Bare `rmux` behaves like new-session, matching tmux.
        None => run_client(cmd_new_session(None)),
    }
}

/// Daemonization has to happen before the runtime exists, which rules out
/// `#[tokio::main]` — the runtime is built by hand after the fork.
fn run_server(daemon_mode: bool, config_path: Option<&str>) {
    let config = Config::load(config_path);
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    let socket_path = paths::socket_path();
    if daemon_mode {
        if let Err(e) = daemon::daemonize(&paths::pid_file_path(&socket_path)) {
            eprintln!("rmux: failed to daemonize: {e}");
            std::process::exit(1);
        }
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build runtime");
    if let Err(e) = runtime.block_on(daemon::serve(&socket_path, config)) {
        tracing::error!("server error: {e}");
        std::process::exit(1);
    }
}

fn run_client<F>(fut: F)
where
    F: std::future::Future<Output = Result<(), ClientError>>,
{
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_string());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build runtime");
    if let Err(e) = runtime.block_on(fut) {
        eprintln!("rmux: {e}");
        std::process::exit(1);
    }
}

async fn cmd_new_session(name: Option<String>) -> Result<(), ClientError> {
    let socket_path = paths::socket_path();
    client::ensure_server_running(&socket_path).await?;
    let outcome = client::attach::run(
        &socket_path,
        AttachTarget::Create {
            name: name.unwrap_or_default(),
        },
    )
    .await?;
    println!("{outcome}");
    Ok(())
}

async fn cmd_attach(target: Option<String>) -> Result<(), ClientError> {
    let socket_path = paths::socket_path();
    if !client::is_server_running(&socket_path).await {
        return Err(ClientError::NoServer);
    }

    let session_id = match target {
        Some(target) => client::find_session(&socket_path, &target).await?.session_id,
        None => {
            let sessions = client::list_sessions(&socket_path).await?;
            match sessions.len() {
                0 => return Err(ClientError::NoSessions),
                1 => sessions[0].session_id,
                _ => {
                    eprintln!("Multiple sessions exist. Use -t to specify target:");
                    for s in &sessions {
                        eprintln!("  {}: {}", s.session_id, s.name);
                    }
                    std::process::exit(1);
                }
            }
        }
    };

    let outcome = client::attach::run(&socket_path, AttachTarget::Existing { session_id }).await?;
    println!("{outcome}");
    Ok(())
}

async fn cmd_list_sessions() -> Result<(), ClientError> {
    let socket_path = paths::socket_path();
    if !client::is_server_running(&socket_path).await {
        return Err(ClientError::NoServer);
    }

    let sessions = client::list_sessions(&socket_path).await?;
    if sessions.is_empty() {
        println!("No sessions");
        return Ok(());
    }
    print_session_table(&sessions);
    Ok(())
}

async fn cmd_kill_session(target: String) -> Result<(), ClientError> {
    let socket_path = paths::socket_path();
    if !client::is_server_running(&socket_path).await {
        return Err(ClientError::NoServer);
    }
    let info = client::kill_session(&socket_path, &target).await?;
    println!("killed session {} ({})", info.session_id, info.name);
    Ok(())
}

async fn cmd_kill_server() -> Result<(), ClientError> {
    let socket_path = paths::socket_path();
    let status = client::kill_server(&socket_path)?;
    println!("{status}");
    Ok(())
}

#[allow(clippy::cast_possible_truncation)]
fn print_session_table(sessions: &[SessionInfo]) {
    println!(
        "{:<4} {:<20} {:<17} {:>8}  {:<9} {:>7}",
        "ID", "NAME", "CREATED", "ATTACHED", "SIZE", "PID"
    );
    for s in sessions {
        let created = chrono::DateTime::from_timestamp(s.created_at as i64, 0)
            .map(|dt| {
                dt.with_timezone(&chrono::Local)
                    .format("%Y-%m-%d %H:%M")
                    .to_string()
            })
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<4} {:<20} {:<17} {:>8}  {:<9} {:>7}",
            s.session_id,
            s.name,
            created,
            s.attached,
            format!("{}x{}", s.cols, s.rows),
            s.pid
        );
    }
}
