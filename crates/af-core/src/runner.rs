use std::path::Path;
use std::process::Command;

use tracing::{debug, error};

// ---------------------------------------------------------------------------
// ToolOutput
// ---------------------------------------------------------------------------

/// Captured result of one external-tool invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    /// A successful invocation with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// A failed invocation with the given stderr.
    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Stdout followed by stderr, trimmed. This is what ends up in errors.
    pub fn combined(&self) -> String {
        let out = self.stdout.trim();
        let err = self.stderr.trim();
        match (out.is_empty(), err.is_empty()) {
            (true, _) => err.to_string(),
            (false, true) => out.to_string(),
            (false, false) => format!("{out}\n{err}"),
        }
    }
}

// ---------------------------------------------------------------------------
// SpawnError
// ---------------------------------------------------------------------------

/// The tool could not be started at all (as opposed to exiting non-zero).
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    /// The binary is missing from PATH.
    #[error("{0} is not installed or not on PATH")]
    NotInstalled(String),

    #[error("failed to run {tool}: {source}")]
    Io {
        tool: String,
        #[source]
        source: std::io::Error,
    },
}

/// Run a prepared command and capture its output.
///
/// A non-zero exit is reported through `ToolOutput::success`, never as an
/// error; only failures to spawn are errors.
pub fn run_command(tool: &str, mut cmd: Command) -> Result<ToolOutput, SpawnError> {
    match cmd.output() {
        Ok(output) => {
            let result = ToolOutput {
                success: output.status.success(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            };
            if !result.success {
                debug!(tool, status = ?output.status.code(), "tool exited non-zero");
            }
            Ok(result)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            error!(tool, "tool not found on PATH");
            Err(SpawnError::NotInstalled(tool.to_string()))
        }
        Err(source) => Err(SpawnError::Io {
            tool: tool.to_string(),
            source,
        }),
    }
}

// ---------------------------------------------------------------------------
// Runner traits (for testability)
// ---------------------------------------------------------------------------

/// Abstraction over the `git` CLI so invocations can be faked in tests.
pub trait GitRunner: Send + Sync {
    /// Run `git -C <dir> <args...>`.
    fn run_git(&self, dir: &Path, args: &[&str]) -> Result<ToolOutput, SpawnError>;
}

/// Abstraction over the remote-publish CLI (`gh`).
pub trait PublishRunner: Send + Sync {
    /// Run `gh <args...>` with `dir` as the working directory.
    fn run_gh(&self, dir: &Path, args: &[&str]) -> Result<ToolOutput, SpawnError>;
}

/// Real git runner that shells out to the `git` binary.
pub struct RealGitRunner;

impl GitRunner for RealGitRunner {
    fn run_git(&self, dir: &Path, args: &[&str]) -> Result<ToolOutput, SpawnError> {
        debug!(dir = %dir.display(), "executing: git {}", args.join(" "));
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(dir).args(args);
        run_command("git", cmd)
    }
}

/// Real publish runner that shells out to the GitHub CLI.
pub struct GhCliRunner;

impl PublishRunner for GhCliRunner {
    fn run_gh(&self, dir: &Path, args: &[&str]) -> Result<ToolOutput, SpawnError> {
        debug!(dir = %dir.display(), "executing: gh {}", args.join(" "));
        let mut cmd = Command::new("gh");
        cmd.args(args).current_dir(dir);
        run_command("gh", cmd)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
