use std::path::{Path, PathBuf};

/// Environment variable that relocates the whole data directory.
pub const DATA_DIR_ENV: &str = "AGENT_FARM_HOME";

/// Directory name used under the user's home when no override is set.
const DEFAULT_DIR_NAME: &str = ".agent-farm";

/// Layout of the agent-farm data directory.
///
/// ```text
/// ~/.agent-farm/
///   config.toml     user configuration
///   state.json      persisted instance records
///   repos.json      per-repository default-branch cache
///   daemon.pid      pid record of the background supervisor
///   af.log          log file used by the interactive frontend
///   worktrees/      one directory per live workspace
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Resolve from `AGENT_FARM_HOME`, falling back to `~/.agent-farm`.
    pub fn resolve() -> Self {
        if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|v| !v.is_empty()) {
            return Self::new(PathBuf::from(dir));
        }
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::new(home.join(DEFAULT_DIR_NAME))
    }

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn state_file(&self) -> PathBuf {
        self.root.join("state.json")
    }

    pub fn repos_file(&self) -> PathBuf {
        self.root.join("repos.json")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.root.join("daemon.pid")
    }

    pub fn log_file(&self) -> PathBuf {
        self.root.join("af.log")
    }

    pub fn worktrees_dir(&self) -> PathBuf {
        self.root.join("worktrees")
    }

    /// Create the root and worktrees directories if missing.
    pub fn ensure(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.worktrees_dir())
    }
}
