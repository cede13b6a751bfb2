use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable that overrides the default config location.
pub const CONFIG_ENV_VAR: &str = "SHELLBRIDGE_CONFIG";

/// Top-level configuration loaded from `~/.shellbridge/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load config from `$SHELLBRIDGE_CONFIG` or `~/.shellbridge/config.toml`,
    /// falling back to defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shell.validate()?;
        self.session.validate()?;
        self.client.validate()?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            if !path.is_empty() {
                return PathBuf::from(path);
            }
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".shellbridge")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_daemon_host")]
    pub host: String,
    #[serde(default = "default_daemon_port")]
    pub port: u16,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: default_daemon_host(),
            port: default_daemon_port(),
        }
    }
}

impl DaemonConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_daemon_host() -> String {
    "127.0.0.1".into()
}
fn default_daemon_port() -> u16 {
    7681
}

// ---------------------------------------------------------------------------
// Shell selector
// ---------------------------------------------------------------------------

/// Which family of shell a session launches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellKind {
    /// The user's login shell on Unix, `cmd.exe` on Windows.
    #[default]
    Default,
    Cmd,
    #[serde(alias = "pwsh")]
    Powershell,
    Wsl,
}

impl ShellKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShellKind::Default => "default",
            ShellKind::Cmd => "cmd",
            ShellKind::Powershell => "powershell",
            ShellKind::Wsl => "wsl",
        }
    }
}

impl std::fmt::Display for ShellKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ShellKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "default" => Ok(ShellKind::Default),
            "cmd" => Ok(ShellKind::Cmd),
            "powershell" | "pwsh" => Ok(ShellKind::Powershell),
            "wsl" => Ok(ShellKind::Wsl),
            other => Err(ConfigError::Validation(format!(
                "unknown shell selector '{other}' (expected default, cmd, powershell or wsl)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ShellConfig {
    #[serde(default, rename = "type")]
    pub kind: ShellKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wsl_distro: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wsl_user: Option<String>,
    /// Start directory. For WSL this is a path inside the distro.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_dir: Option<String>,
    /// Explicit executable, replacing the one implied by `type`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

impl ShellConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kind != ShellKind::Wsl && (self.wsl_distro.is_some() || self.wsl_user.is_some()) {
            return Err(ConfigError::Validation(format!(
                "shell.wsl_distro/wsl_user require shell.type = \"wsl\" (got \"{}\")",
                self.kind
            )));
        }
        if let Some(program) = &self.program {
            if program.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "shell.program must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
    /// Initial state of the prompt watcher for new sessions.
    #[serde(default)]
    pub prompt_watcher: bool,
    #[serde(default = "default_term")]
    pub term: String,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            rows: default_rows(),
            cols: default_cols(),
            read_chunk_size: default_read_chunk_size(),
            prompt_watcher: false,
            term: default_term(),
            max_sessions: default_max_sessions(),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rows == 0 || self.cols == 0 {
            return Err(ConfigError::Validation(format!(
                "session.rows and session.cols must be non-zero (got {}x{})",
                self.rows, self.cols
            )));
        }
        if self.read_chunk_size == 0 {
            return Err(ConfigError::Validation(
                "session.read_chunk_size must be non-zero".to_string(),
            ));
        }
        if self.max_sessions == 0 {
            return Err(ConfigError::Validation(
                "session.max_sessions must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_rows() -> u16 {
    24
}
fn default_cols() -> u16 {
    80
}
fn default_read_chunk_size() -> usize {
    4096
}
fn default_term() -> String {
    "xterm-256color".into()
}
fn default_max_sessions() -> usize {
    32
}

// ---------------------------------------------------------------------------
// Client connection protocol
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_disconnect_threshold_ms")]
    pub disconnect_threshold_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_attempts: default_max_attempts(),
            disconnect_threshold_ms: default_disconnect_threshold_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            tick_ms: default_tick_ms(),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "client.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.tick_ms == 0 || self.poll_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "client.tick_ms and client.poll_interval_ms must be non-zero".to_string(),
            ));
        }
        if self.max_attempts > 30 {
            return Err(ConfigError::Validation(format!(
                "client.max_attempts is too large ({}), backoff would overflow",
                self.max_attempts
            )));
        }
        Ok(())
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn disconnect_threshold(&self) -> Duration {
        Duration::from_millis(self.disconnect_threshold_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_attempts() -> u32 {
    5
}
fn default_disconnect_threshold_ms() -> u64 {
    5000
}
fn default_poll_interval_ms() -> u64 {
    3000
}
fn default_tick_ms() -> u64 {
    1000
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_kind_parses_aliases() {
        assert_eq!("PowerShell".parse::<ShellKind>().unwrap(), ShellKind::Powershell);
        assert_eq!("pwsh".parse::<ShellKind>().unwrap(), ShellKind::Powershell);
        assert_eq!("".parse::<ShellKind>().unwrap(), ShellKind::Default);
        assert!("fish".parse::<ShellKind>().is_err());
    }

    #[test]
    fn client_durations() {
        let c = ClientConfig::default();
        assert_eq!(c.base_delay(), Duration::from_secs(1));
        assert_eq!(c.disconnect_threshold(), Duration::from_secs(5));
        assert_eq!(c.poll_interval(), Duration::from_secs(3));
    }
}
