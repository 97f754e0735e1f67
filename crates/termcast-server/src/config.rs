//! Broker configuration: TOML file + CLI overrides.
//!
//! Read once at startup; the broker exposes no runtime reconfiguration.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use termcast_core::{CastError, CastResult};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub terminal: TerminalSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Directory holding the viewer front-end assets (xterm.js and
    /// friends). Absent means no `/assets` route is mounted.
    #[serde(default)]
    pub assets_dir: Option<String>,
    /// Seconds before a viewerless, inactive session is collected.
    /// Zero disables collection: sessions then live forever.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            assets_dir: None,
            idle_timeout: default_idle_timeout(),
        }
    }
}

/// `[terminal]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct TerminalSection {
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory for new sessions; defaults to the broker's own.
    #[serde(default)]
    pub cwd: Option<String>,
    /// Extra environment entries layered over the inherited environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
}

impl Default for TerminalSection {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            cols: default_cols(),
            rows: default_rows(),
        }
    }
}

fn default_port() -> u16 {
    3001
}
fn default_idle_timeout() -> u64 {
    3600
}
fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "bash".to_string())
}
fn default_cols() -> u16 {
    80
}
fn default_rows() -> u16 {
    30
}

/// Resolved broker configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// HTTP port; the WebSocket listener binds `port + 1`.
    pub port: u16,
    pub assets_dir: Option<PathBuf>,
    pub idle_timeout: u64,
    pub shell: String,
    pub shell_args: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub cols: u16,
    pub rows: u16,
}

impl BrokerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    #[allow(clippy::too_many_arguments)]
    pub fn load(
        config_path: Option<&Path>,
        cli_port: Option<u16>,
        cli_shell: Option<&str>,
        cli_shell_args: &[String],
        cli_cwd: Option<&str>,
        cli_cols: Option<u16>,
        cli_rows: Option<u16>,
        cli_assets_dir: Option<&str>,
        cli_idle_timeout: Option<u64>,
    ) -> CastResult<Self> {
        // Load base config from file
        let file_config = if let Some(path) = config_path {
            let expanded = expand_tilde(path);
            if expanded.exists() {
                info!(path = %expanded.display(), "loading config file");
                let content = std::fs::read_to_string(&expanded)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| CastError::Config(format!("config parse error: {e}")))?
            } else {
                info!(path = %expanded.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
        } else {
            ConfigFile::default()
        };

        // Merge CLI overrides
        let port = cli_port.unwrap_or(file_config.server.port);
        let shell = cli_shell
            .map(|s| s.to_string())
            .unwrap_or(file_config.terminal.shell);
        let shell_args = if cli_shell_args.is_empty() {
            file_config.terminal.args
        } else {
            cli_shell_args.to_vec()
        };
        let cwd = match cli_cwd.or(file_config.terminal.cwd.as_deref()) {
            Some(dir) => expand_tilde_str(dir),
            None => std::env::current_dir()?,
        };
        let cols = cli_cols.unwrap_or(file_config.terminal.cols);
        let rows = cli_rows.unwrap_or(file_config.terminal.rows);
        let assets_dir = cli_assets_dir
            .map(|s| s.to_string())
            .or(file_config.server.assets_dir)
            .map(|s| expand_tilde_str(&s));
        let idle_timeout = cli_idle_timeout.unwrap_or(file_config.server.idle_timeout);

        if cols == 0 || rows == 0 {
            return Err(CastError::Config(format!(
                "terminal geometry must be non-zero, got {cols}x{rows}"
            )));
        }

        Ok(Self {
            port,
            assets_dir,
            idle_timeout,
            shell,
            shell_args,
            cwd,
            env: file_config.terminal.env,
            cols,
            rows,
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
