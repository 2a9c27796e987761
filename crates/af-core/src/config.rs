use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::paths::DataDir;

/// User configuration loaded from `~/.agent-farm/config.toml`.
///
/// Every field has a default, so an empty or partial file is valid. A missing
/// file is materialised with defaults on first load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Command line launched inside each new session.
    #[serde(default = "default_program")]
    pub default_program: String,
    /// Automatically accept confirmation prompts.
    #[serde(default)]
    pub auto_yes: bool,
    /// Supervisor poll period in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub daemon_poll_interval_ms: u64,
    /// Prefix prepended to every generated branch name.
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_program: default_program(),
            auto_yes: false,
            daemon_poll_interval_ms: default_poll_interval_ms(),
            branch_prefix: default_branch_prefix(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load from the data directory, writing defaults when the file is absent.
    pub fn load(data: &DataDir) -> Result<Self, ConfigError> {
        let path = data.config_file();
        if path.exists() {
            return Self::load_from(&path);
        }
        let cfg = Config::default();
        cfg.save_to(&path)?;
        info!(path = %path.display(), "wrote default config");
        Ok(cfg)
    }

    /// Load from a specific path.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text =
            std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Write to a specific path, creating parent directories.
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }
        let text = self.to_toml()?;
        std::fs::write(path, text).map_err(|e| ConfigError::Io(e.to_string()))
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.daemon_poll_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "daemon_poll_interval_ms must be greater than zero".into(),
            ));
        }
        if self.default_program.trim().is_empty() {
            return Err(ConfigError::Validation(
                "default_program must not be empty".into(),
            ));
        }
        if self.branch_prefix.chars().any(char::is_whitespace) {
            return Err(ConfigError::Validation(format!(
                "branch_prefix '{}' must not contain whitespace",
                self.branch_prefix
            )));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.daemon_poll_interval_ms)
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
// Defaults
// ---------------------------------------------------------------------------

fn default_program() -> String {
    match find_on_path("claude") {
        Some(path) => path.display().to_string(),
        None => "claude".into(),
    }
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_branch_prefix() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default();
    branch_prefix_for(&user)
}

fn default_log_level() -> String {
    "info".into()
}

/// `<lowercased user>/`, or `session/` when the user name is unusable.
pub fn branch_prefix_for(user: &str) -> String {
    let user = user.trim().to_lowercase();
    if user.is_empty() || user.chars().any(char::is_whitespace) {
        "session/".into()
    } else {
        format!("{user}/")
    }
}

/// Search `PATH` for an executable named `program`.
pub fn find_on_path(program: &str) -> Option<PathBuf> {
    find_in(program, std::env::var_os("PATH"))
}

fn find_in(program: &str, paths: Option<impl AsRef<OsStr>>) -> Option<PathBuf> {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    which::which_in(program, paths, cwd).ok()
}
