use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use af_core::error::ErrorClass;
use af_core::runner::{run_command, SpawnError, ToolOutput};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::program::ProgramKind;

/// Prefix carried by every session this tool creates.
pub const SESSION_PREFIX: &str = "af_";

/// Scrollback kept per session.
pub const HISTORY_LIMIT: u32 = 10_000;

const START_TIMEOUT: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("tmux is not installed or not on PATH")]
    TmuxMissing,

    #[error("tmux session '{0}' does not exist")]
    NoSession(String),

    #[error("tmux {command} failed: {output}")]
    Command { command: String, output: String },

    #[error("tmux session '{name}' did not appear within {waited:?}")]
    StartTimeout { name: String, waited: Duration },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SessionError::TmuxMissing | SessionError::NoSession(_) => ErrorClass::ResourceAbsence,
            SessionError::Command { .. } | SessionError::StartTimeout { .. } => {
                ErrorClass::ExternalTool
            }
            SessionError::Io(_) => ErrorClass::Io,
        }
    }
}

impl From<SpawnError> for SessionError {
    fn from(e: SpawnError) -> Self {
        match e {
            SpawnError::NotInstalled(_) => SessionError::TmuxMissing,
            SpawnError::Io { source, .. } => SessionError::Io(source),
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

// ---------------------------------------------------------------------------
// TmuxRunner trait (for testability)
// ---------------------------------------------------------------------------

/// Abstraction over the tmux CLI.
pub trait TmuxRunner: Send + Sync {
    /// Run `tmux <args...>` and capture its output.
    fn run(&self, args: &[&str]) -> std::result::Result<ToolOutput, SpawnError>;

    /// Attach the current terminal to `name`, blocking until the user detaches.
    fn attach(&self, name: &str) -> Result<()>;
}

/// Real runner that shells out to the `tmux` binary.
pub struct RealTmux;

impl TmuxRunner for RealTmux {
    fn run(&self, args: &[&str]) -> std::result::Result<ToolOutput, SpawnError> {
        debug!("executing: tmux {}", args.join(" "));
        let mut cmd = Command::new("tmux");
        cmd.args(args);
        run_command("tmux", cmd)
    }

    fn attach(&self, name: &str) -> Result<()> {
        let status = Command::new("tmux")
            .args(["attach-session", "-t", name])
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => SessionError::TmuxMissing,
                _ => SessionError::Io(e),
            })?;
        if status.success() {
            Ok(())
        } else {
            Err(SessionError::Command {
                command: format!("attach-session -t {name}"),
                output: format!("exited with {status}"),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// TmuxSession
// ---------------------------------------------------------------------------

/// One named, detached tmux session.
#[derive(Clone)]
pub struct TmuxSession {
    name: String,
    runner: Arc<dyn TmuxRunner>,
}

impl std::fmt::Debug for TmuxSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TmuxSession").field("name", &self.name).finish()
    }
}

impl TmuxSession {
    /// Session for an instance title (`af_<title>`).
    pub fn for_title(title: &str, runner: Arc<dyn TmuxRunner>) -> Self {
        Self::with_name(session_name(title), runner)
    }

    pub fn with_name(name: impl Into<String>, runner: Arc<dyn TmuxRunner>) -> Self {
        Self {
            name: name.into(),
            runner,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exists(&self) -> Result<bool> {
        let target = format!("-t={}", self.name);
        let out = self.runner.run(&["has-session", &target])?;
        Ok(out.success)
    }

    /// Start `program` in a new detached session rooted at `workdir`.
    ///
    /// A session that already exists is left as is and the program is not
    /// started a second time.
    pub fn start(&self, program: &str, workdir: &Path) -> Result<()> {
        if self.exists()? {
            info!(session = %self.name, "session already exists, reusing");
            return Ok(());
        }

        let dir = workdir.to_string_lossy();
        self.tmux(&["new-session", "-d", "-s", &self.name, "-c", &dir, program])?;

        if let Err(e) = self.wait_until_exists() {
            if let Err(kill_err) = self.kill() {
                warn!(session = %self.name, error = %kill_err, "failed to clean up session after start timeout");
            }
            return Err(e);
        }

        let limit = HISTORY_LIMIT.to_string();
        if let Err(e) = self.tmux(&["set-option", "-t", &self.name, "history-limit", &limit]) {
            warn!(session = %self.name, error = %e, "failed to set history limit");
        }
        info!(session = %self.name, program, workdir = %workdir.display(), "session started");
        Ok(())
    }

    /// Re-bind to a session that survived a restart, without restarting the
    /// program inside it.
    pub fn restore(&self) -> Result<()> {
        if !self.exists()? {
            return Err(SessionError::NoSession(self.name.clone()));
        }
        debug!(session = %self.name, "session restored");
        Ok(())
    }

    /// Visible pane contents, with escape sequences and joined wrapped lines.
    pub fn capture(&self) -> Result<String> {
        self.capture_with(&["capture-pane", "-p", "-e", "-J", "-t", &self.name])
    }

    /// The full scrollback.
    pub fn capture_history(&self) -> Result<String> {
        self.capture_with(&[
            "capture-pane", "-p", "-e", "-J", "-S", "-", "-E", "-", "-t", &self.name,
        ])
    }

    /// Send tmux key names (e.g. `Enter`, `D`).
    pub fn send_keys(&self, keys: &[&str]) -> Result<()> {
        let mut args = vec!["send-keys", "-t", self.name.as_str()];
        args.extend_from_slice(keys);
        self.tmux(&args).map(|_| ())
    }

    /// Send the confirm sequence for `kind`.
    pub fn tap_confirm(&self, kind: ProgramKind) -> Result<()> {
        debug!(session = %self.name, program = %kind, "confirming prompt");
        self.send_keys(kind.confirm_keys())
    }

    /// Type `text` literally, then press Enter.
    pub fn send_text(&self, text: &str) -> Result<()> {
        self.tmux(&["send-keys", "-l", "-t", &self.name, text])?;
        self.send_keys(&["Enter"])
    }

    /// Terminate the session. A session that no longer exists is not an error.
    pub fn kill(&self) -> Result<()> {
        match self.tmux(&["kill-session", "-t", &self.name]) {
            Ok(_) => {
                info!(session = %self.name, "session killed");
                Ok(())
            }
            Err(SessionError::Command { .. }) if !self.exists()? => {
                debug!(session = %self.name, "session already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Hand the terminal to the user on a background thread.
    ///
    /// The returned channel receives one message when the user detaches.
    pub fn attach(&self) -> Result<flume::Receiver<()>> {
        if !self.exists()? {
            return Err(SessionError::NoSession(self.name.clone()));
        }
        let (tx, rx) = flume::bounded(1);
        let runner = Arc::clone(&self.runner);
        let name = self.name.clone();
        thread::Builder::new()
            .name(format!("attach-{name}"))
            .spawn(move || {
                if let Err(e) = runner.attach(&name) {
                    error!(session = %name, error = %e, "attach failed");
                }
                let _ = tx.send(());
            })?;
        Ok(rx)
    }

    fn wait_until_exists(&self) -> Result<()> {
        let started = Instant::now();
        let mut delay = Duration::from_millis(5);
        loop {
            if self.exists()? {
                return Ok(());
            }
            let waited = started.elapsed();
            if waited >= START_TIMEOUT {
                return Err(SessionError::StartTimeout {
                    name: self.name.clone(),
                    waited,
                });
            }
            thread::sleep(delay.min(START_TIMEOUT - waited));
            delay = (delay * 2).min(Duration::from_millis(500));
        }
    }

    fn capture_with(&self, args: &[&str]) -> Result<String> {
        match self.tmux(args) {
            Ok(out) => Ok(out),
            Err(SessionError::Command { .. }) if !self.exists()? => {
                Err(SessionError::NoSession(self.name.clone()))
            }
            Err(e) => Err(e),
        }
    }

    fn tmux(&self, args: &[&str]) -> Result<String> {
        run_checked(self.runner.as_ref(), args)
    }
}

fn run_checked(runner: &dyn TmuxRunner, args: &[&str]) -> Result<String> {
    let out = runner.run(args)?;
    if out.success {
        return Ok(out.stdout);
    }
    let command = args.join(" ");
    let output = out.combined();
    error!(command = %command, output = %output, "tmux command failed");
    Err(SessionError::Command { command, output })
}

/// `af_<title>` with whitespace and `.` replaced by `_` (tmux rejects `.`).
pub fn session_name(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .map(|c| if c.is_whitespace() || c == '.' { '_' } else { c })
        .collect();
    format!("{SESSION_PREFIX}{cleaned}")
}

/// Kill every session whose name carries [`SESSION_PREFIX`].
///
/// A missing tmux server counts as nothing to clean up.
pub fn cleanup_sessions(runner: &Arc<dyn TmuxRunner>) -> Result<usize> {
    let out = runner.run(&["list-sessions", "-F", "#{session_name}"])?;
    if !out.success {
        let output = out.combined();
        if output.contains("no server running") || output.contains("error connecting") {
            return Ok(0);
        }
        return Err(SessionError::Command {
            command: "list-sessions".into(),
            output,
        });
    }

    let mut killed = 0;
    for name in out.stdout.lines().map(str::trim) {
        if !name.starts_with(SESSION_PREFIX) {
            continue;
        }
        TmuxSession::with_name(name, Arc::clone(runner)).kill()?;
        killed += 1;
    }
    info!(killed, "cleaned up tmux sessions");
    Ok(killed)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
