//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `SHELL` for the shell to exec,
//!    `RUST_LOG` for the log filter
//! 2. **Config file** — path via `rmux server --config <path>`, or
//!    `~/.config/rmux/config.toml` if present
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! scrollback_lines = 2000
//!
//! [shell]
//! default_shell = "/bin/sh"
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Daemon resource settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Scrollback lines kept per pane (default 2000).
    #[serde(default = "default_scrollback_lines")]
    pub scrollback_lines: usize,
}

/// Shell settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ShellConfig {
    /// Shell to exec for new panes when `$SHELL` is unset (default `/bin/sh`).
    #[serde(default = "default_shell")]
    pub default_shell: String,
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log filter when `RUST_LOG` is unset (default `info`).
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_scrollback_lines() -> usize {
    2000
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            scrollback_lines: default_scrollback_lines(),
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            default_shell: default_shell(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure — a config the
    /// user named must parse). Otherwise looks for `~/.config/rmux/config.toml`,
    /// falling back to compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            return toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"));
        }
        if let Some(p) = default_config_path() {
            if let Ok(content) = std::fs::read_to_string(&p) {
                match toml::from_str(&content) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Ignoring malformed {}: {e}", p.display());
                    }
                }
            }
        }
        Config::default()
    }

    /// Shell to exec for new panes: `$SHELL` wins over the configured default.
    pub fn shell_command(&self) -> String {
        std::env::var("SHELL").unwrap_or_else(|_| self.shell.default_shell.clone())
    }
}

fn default_config_path() -> Option<PathBuf> {
    let home = std::env::var("HOME").ok()?;
    Some(Path::new(&home).join(".config/rmux/config.toml"))
}
