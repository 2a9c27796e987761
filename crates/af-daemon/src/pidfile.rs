//! Daemon pid file and the launch/stop handoff built on it.
//!
//! The foreground `af` process and the detached daemon never poll at the
//! same time. Before a foreground command touches instances it calls
//! [`stop_daemon`], which reads `daemon.pid`, sends SIGTERM and waits for the
//! daemon to save and exit. On the way out it may call [`launch_daemon`]
//! again.
//!
//! ## Race safety
//!
//! [`PidFile::acquire`] uses `O_CREAT | O_EXCL`. If two daemons race, exactly
//! one wins the create; the loser sees `AlreadyExists` and checks whether the
//! winner is alive.
//!
//! ## Stale pid files
//!
//! [`PidFile::read_valid`] checks the pid with `kill(pid, 0)`. A dead pid
//! (crash, SIGKILL) means the file is stale, and it is removed.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use af_core::paths::{DataDir, DATA_DIR_ENV};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{DaemonError, Result};

/// How long [`stop_daemon`] waits for the daemon to exit after SIGTERM.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Contents of `daemon.pid`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidFile {
    pub pid: u32,
    pub started_at: String,
    pub version: String,
}

/// Result of trying to acquire the pid file.
#[derive(Debug)]
pub enum AcquireResult {
    /// We created the file and own it.
    Acquired,
    /// Another live daemon holds it.
    AlreadyRunning(PidFile),
    /// Stale file was cleaned up; retry.
    StaleRemoved,
}

impl PidFile {
    pub fn for_pid(pid: u32) -> Self {
        Self {
            pid,
            started_at: Utc::now().to_rfc3339(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// A record for the calling process.
    pub fn current() -> Self {
        Self::for_pid(std::process::id())
    }

    /// Try to exclusively create and write the pid file.
    pub fn acquire(&self, path: &Path) -> std::io::Result<AcquireResult> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        match OpenOptions::new()
            .write(true)
            .create_new(true) // O_CREAT | O_EXCL: fails if the file exists
            .open(path)
        {
            Ok(mut file) => {
                let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
                file.write_all(json.as_bytes())?;
                file.sync_all()?;
                Ok(AcquireResult::Acquired)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => match Self::read(path) {
                Some(existing) if existing.pid == self.pid => Ok(AcquireResult::Acquired),
                Some(existing) if existing.is_alive() => Ok(AcquireResult::AlreadyRunning(existing)),
                _ => {
                    info!(path = %path.display(), "removing stale daemon pid file");
                    Self::remove(path);
                    Ok(AcquireResult::StaleRemoved)
                }
            },
            Err(e) => Err(e),
        }
    }

    /// Acquire with one retry after stale cleanup.
    pub fn acquire_or_fail(&self, path: &Path) -> Result<()> {
        for attempt in 0..2 {
            match self.acquire(path)? {
                AcquireResult::Acquired => return Ok(()),
                AcquireResult::AlreadyRunning(existing) => {
                    return Err(DaemonError::AlreadyRunning(existing.pid));
                }
                AcquireResult::StaleRemoved if attempt == 0 => {
                    debug!("stale pid file removed, retrying acquire");
                }
                AcquireResult::StaleRemoved => break,
            }
        }
        Err(DaemonError::Io(std::io::Error::other(
            "failed to acquire pid file after stale cleanup",
        )))
    }

    /// Overwrite the pid file unconditionally.
    pub fn write(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }

    /// Returns `None` if missing or unparseable.
    pub fn read(path: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }

    pub fn remove(path: &Path) {
        let _ = std::fs::remove_file(path);
    }

    pub fn is_alive(&self) -> bool {
        pid_alive(self.pid)
    }

    /// Read the pid file, validate the pid is alive, and remove stale or
    /// corrupt files.
    pub fn read_valid(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }
        match Self::read(path) {
            Some(pf) if pf.is_alive() => Some(pf),
            Some(pf) => {
                info!(pid = pf.pid, "removing stale daemon pid file (process not running)");
                Self::remove(path);
                None
            }
            None => {
                warn!(path = %path.display(), "removing unreadable daemon pid file");
                Self::remove(path);
                None
            }
        }
    }
}

/// Spawn `<current exe> --daemon` detached from the terminal and record its
/// pid. Returns the pid of the daemon, which is the existing one if a live
/// daemon already holds the pid file.
pub fn launch_daemon(data: &DataDir) -> Result<u32> {
    let path = data.pid_file();
    if let Some(existing) = PidFile::read_valid(&path) {
        debug!(pid = existing.pid, "daemon already running");
        return Ok(existing.pid);
    }
    data.ensure()?;

    let exe = std::env::current_exe()?;
    let mut cmd = Command::new(exe);
    cmd.arg("--daemon")
        .env(DATA_DIR_ENV, data.root())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    detach(&mut cmd);

    let child = cmd.spawn()?;
    let pid = child.id();
    PidFile::for_pid(pid).write(&path)?;
    info!(pid, "daemon launched");
    Ok(pid)
}

/// SIGTERM the running daemon and wait up to [`STOP_TIMEOUT`] for it to go.
///
/// A missing pid file or a dead pid is not an error. Returns whether a live
/// daemon was signalled.
pub fn stop_daemon(data: &DataDir) -> Result<bool> {
    stop_daemon_within(data, STOP_TIMEOUT)
}

/// [`stop_daemon`] with an explicit wait.
///
/// A daemon that outlives the wait keeps its pid file and is reported as
/// [`DaemonError::StillRunning`], so no caller starts polling beside it.
pub fn stop_daemon_within(data: &DataDir, timeout: Duration) -> Result<bool> {
    let path = data.pid_file();
    let Some(pf) = PidFile::read_valid(&path) else {
        return Ok(false);
    };
    if pf.pid == std::process::id() {
        PidFile::remove(&path);
        return Ok(false);
    }

    terminate(pf.pid)?;
    let deadline = Instant::now() + timeout;
    while pid_alive(pf.pid) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(25));
    }
    if pid_alive(pf.pid) {
        warn!(pid = pf.pid, timeout_ms = timeout.as_millis() as u64, "daemon still alive after SIGTERM");
        return Err(DaemonError::StillRunning(pf.pid));
    }
    info!(pid = pf.pid, "daemon stopped");
    PidFile::remove(&path);
    Ok(true)
}

#[cfg(unix)]
fn detach(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;

    // SAFETY: setsid is async-signal-safe and touches no parent state.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn detach(_cmd: &mut Command) {}

#[cfg(unix)]
fn terminate(pid: u32) -> Result<()> {
    // SAFETY: plain syscall, no memory is shared.
    if unsafe { libc::kill(pid as i32, libc::SIGTERM) } == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(DaemonError::Signal { pid, source: err })
}

#[cfg(not(unix))]
fn terminate(pid: u32) -> Result<()> {
    Err(DaemonError::Signal {
        pid,
        source: std::io::Error::other("signals are not supported on this platform"),
    })
}

/// Check if a process with the given PID is alive.
#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    // SAFETY: kill with signal 0 checks existence without sending a signal.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_pid_is_alive() {
        assert!(pid_alive(std::process::id()));
    }

    #[test]
    fn bogus_pid_is_dead() {
        // PID 4_000_000 is extremely unlikely to exist.
        assert!(!pid_alive(4_000_000));
    }

    #[cfg(unix)]
    #[test]
    fn acquire_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.pid");

        assert!(matches!(
            PidFile::current().acquire(&path).unwrap(),
            AcquireResult::Acquired
        ));
        // Same process again: still ours.
        PidFile::current().acquire_or_fail(&path).unwrap();

        let parent_pid = std::os::unix::process::parent_id();
        PidFile::for_pid(parent_pid).write(&path).unwrap();
        match PidFile::current().acquire_or_fail(&path) {
            Err(DaemonError::AlreadyRunning(pid)) if pid == parent_pid => {}
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }
    }

    #[test]
    fn stale_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        PidFile::for_pid(4_000_000).write(&path).unwrap();

        PidFile::current().acquire_or_fail(&path).unwrap();
        assert_eq!(PidFile::read(&path).unwrap().pid, std::process::id());
    }

    #[cfg(unix)]
    fn spawn_ready(script: &str) -> std::process::Child {
        use std::io::BufRead;

        let mut child = Command::new("sh")
            .args(["-c", script])
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let mut line = String::new();
        std::io::BufReader::new(child.stdout.as_mut().unwrap())
            .read_line(&mut line)
            .unwrap();
        assert_eq!(line.trim(), "ready");
        child
    }

    #[cfg(unix)]
    #[test]
    fn stop_keeps_the_pid_file_of_a_daemon_that_ignores_sigterm() {
        let dir = tempfile::tempdir().unwrap();
        let data = DataDir::new(dir.path());
        let mut child = spawn_ready("trap '' TERM; echo ready; exec sleep 30");
        PidFile::for_pid(child.id()).write(&data.pid_file()).unwrap();

        match stop_daemon_within(&data, Duration::from_millis(200)) {
            Err(DaemonError::StillRunning(pid)) => assert_eq!(pid, child.id()),
            other => panic!("expected StillRunning, got {other:?}"),
        }
        assert_eq!(PidFile::read(&data.pid_file()).unwrap().pid, child.id());

        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn stop_removes_the_pid_file_once_the_daemon_exits() {
        let dir = tempfile::tempdir().unwrap();
        let data = DataDir::new(dir.path());
        let mut child = spawn_ready("echo ready; exec sleep 30");
        let pid = child.id();
        PidFile::for_pid(pid).write(&data.pid_file()).unwrap();
        let reaper = std::thread::spawn(move || child.wait().unwrap());

        assert!(stop_daemon_within(&data, Duration::from_secs(5)).unwrap());
        assert!(!data.pid_file().exists());
        assert!(!reaper.join().unwrap().success());
    }

    #[test]
    fn read_valid_removes_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        std::fs::write(&path, "not json").unwrap();

        assert!(PidFile::read_valid(&path).is_none());
        assert!(!path.exists());
        assert!(PidFile::read_valid(&path).is_none());
    }
}
