//! Configuration management for the Sandpit server.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/sandpit/config.toml`.

use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::Dimensions;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::admission::Limit;
use crate::project::SessionSettings;
use crate::sandbox::ShellOptions;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("bind must be a socket address like 127.0.0.1:4000, got {0}")]
    InvalidBind(String),

    #[error("max_connections must be between 1 and 100000, got {0}")]
    InvalidMaxConnections(usize),

    #[error("idle_timeout_secs must be between 1 and 86400, got {0}")]
    InvalidIdleTimeout(u64),

    #[error("preview_host must contain {{port}}, got {0}")]
    InvalidPreviewHost(String),

    #[error("terminal size must be non-zero, got {cols}x{rows}")]
    InvalidTerminalSize { cols: u16, rows: u16 },

    #[error("default_shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("deploy url must start with http:// or https://, got {0}")]
    InvalidDeployUrl(String),

    #[error("limit for {0} must have non-zero points and window")]
    InvalidLimit(&'static str),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the Sandpit server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// WebSocket listener.
    pub server: ServerConfig,

    /// Local sandbox provider.
    pub sandbox: SandboxConfig,

    /// Terminal and project session behaviour.
    pub session: SessionConfig,

    /// Remote deployment service.
    pub deploy: DeployConfig,

    /// Rate limits for mutating file operations.
    pub limits: LimitsConfig,

    /// Project record store.
    pub store: StoreConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for daemon state.
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Also write a daily rolling log file here.
    pub log_dir: Option<PathBuf>,
}

/// WebSocket listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address.
    pub bind: String,

    /// Connections served at once; further handshakes wait.
    pub max_connections: usize,
}

/// Local sandbox provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SandboxConfig {
    /// Where sandboxes live on disk.
    pub root_dir: PathBuf,

    /// Template trees, one directory per template name.
    pub templates_dir: PathBuf,

    /// Idle deadline applied on initialize and owner heartbeats.
    pub idle_timeout_secs: u64,

    /// Public host of a sandbox port. `{port}` and `{sandbox}` are replaced.
    pub preview_host: String,

    /// Expired sandboxes older than this are deleted.
    pub retention_secs: u64,
}

/// Terminal and project session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell for new terminals.
    pub default_shell: String,

    /// Working directory of new terminals, relative to the project root.
    pub working_dir: Option<String>,

    /// Initial terminal columns.
    pub cols: u16,

    /// Initial terminal rows.
    pub rows: u16,

    /// Refuse collaborators while no owner is connected.
    pub require_owner_presence: bool,

    /// Push `loaded` refreshes when project files change.
    pub watch_files: bool,
}

/// Deployment service configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeployConfig {
    /// Base URL of the service. Deployment is disabled when unset.
    pub url: Option<String>,

    /// Bearer token.
    pub token: Option<String>,

    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

/// One fixed-window budget.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LimitConfig {
    pub points: u32,
    pub window_secs: u64,
}

impl LimitConfig {
    pub fn to_limit(self) -> Limit {
        Limit {
            points: self.points,
            window: Duration::from_secs(self.window_secs),
        }
    }
}

/// Rate limits for mutating file operations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LimitsConfig {
    pub save_file: LimitConfig,
    pub create_file: LimitConfig,
    pub create_folder: LimitConfig,
    pub rename_file: LimitConfig,
    pub delete_file: LimitConfig,
}

/// Project record store configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON file holding project records.
    pub path: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:4000".to_string(),
            max_connections: 256,
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            root_dir: data_dir.join("sandboxes"),
            templates_dir: data_dir.join("templates"),
            idle_timeout_secs: 300, // 5 minutes
            preview_host: "{port}-{sandbox}.localhost".to_string(),
            retention_secs: 24 * 60 * 60,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_shell: default_shell(),
            working_dir: None,
            cols: 80,
            rows: 24,
            require_owner_presence: false,
            watch_files: true,
        }
    }
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            timeout_secs: 30,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        let per_second = |points| LimitConfig {
            points,
            window_secs: 1,
        };
        Self {
            save_file: per_second(10),
            create_file: per_second(5),
            create_folder: per_second(5),
            rename_file: per_second(5),
            delete_file: per_second(5),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_data_dir().join("projects.json"),
        }
    }
}

impl LimitsConfig {
    /// Limits keyed by the event name they apply to.
    pub fn by_event(&self) -> HashMap<String, Limit> {
        self.entries()
            .into_iter()
            .map(|(event, _, limit)| (event.to_string(), limit.to_limit()))
            .collect()
    }

    fn entries(&self) -> [(&'static str, &'static str, LimitConfig); 5] {
        [
            ("saveFile", "save_file", self.save_file),
            ("createFile", "create_file", self.create_file),
            ("createFolder", "create_folder", self.create_folder),
            ("renameFile", "rename_file", self.rename_file),
            ("deleteFile", "delete_file", self.delete_file),
        ]
    }
}

impl SandboxConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sandpit")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sandpit")
}

/// Returns the default shell for the current platform.
fn default_shell() -> String {
    if cfg!(windows) {
        "powershell.exe".to_string()
    } else {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
    }
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - SANDPIT_BIND: Override the listen address
    /// - SANDPIT_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - SANDPIT_DEPLOY_URL: Override the deployment service URL
    pub fn apply_env_overrides(&mut self) {
        if let Ok(bind) = std::env::var("SANDPIT_BIND") {
            if !bind.is_empty() {
                tracing::info!("Overriding bind from environment: {}", bind);
                self.server.bind = bind;
            }
        }

        if let Ok(level) = std::env::var("SANDPIT_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }

        if let Ok(url) = std::env::var("SANDPIT_DEPLOY_URL") {
            if !url.is_empty() {
                tracing::info!("Overriding deploy url from environment: {}", url);
                self.deploy.url = Some(url);
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.bind.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidBind(self.server.bind.clone()));
        }

        if self.server.max_connections < 1 || self.server.max_connections > 100_000 {
            return Err(ConfigError::InvalidMaxConnections(self.server.max_connections));
        }

        if self.sandbox.idle_timeout_secs < 1 || self.sandbox.idle_timeout_secs > 86_400 {
            return Err(ConfigError::InvalidIdleTimeout(self.sandbox.idle_timeout_secs));
        }

        if !self.sandbox.preview_host.contains("{port}") {
            return Err(ConfigError::InvalidPreviewHost(self.sandbox.preview_host.clone()));
        }

        if self.session.cols == 0 || self.session.rows == 0 {
            return Err(ConfigError::InvalidTerminalSize {
                cols: self.session.cols,
                rows: self.session.rows,
            });
        }

        // Validate default_shell path exists
        let shell_path = Path::new(&self.session.default_shell);
        if shell_path.is_absolute() {
            if !shell_path.exists() {
                return Err(ConfigError::InvalidShellPath(
                    self.session.default_shell.clone(),
                ));
            }
        } else if which::which(&self.session.default_shell).is_err() {
            return Err(ConfigError::InvalidShellPath(
                self.session.default_shell.clone(),
            ));
        }

        if let Some(url) = &self.deploy.url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::InvalidDeployUrl(url.clone()));
            }
        }

        for (_, name, limit) in self.limits.entries() {
            if limit.points == 0 || limit.window_secs == 0 {
                return Err(ConfigError::InvalidLimit(name));
            }
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(
                self.daemon.log_level.clone(),
            ));
        }

        Ok(())
    }

    /// Settings shared by every project session.
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            idle_timeout: self.sandbox.idle_timeout(),
            shell: ShellOptions {
                shell: Some(self.session.default_shell.clone()),
                cwd: self.session.working_dir.clone(),
                dimensions: Dimensions {
                    cols: self.session.cols,
                    rows: self.session.rows,
                },
                ..ShellOptions::default()
            },
            watch_files: self.session.watch_files,
            ..SessionSettings::default()
        }
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
