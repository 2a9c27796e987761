pub mod debug;
pub mod lifecycle;
pub mod list;
pub mod new;
pub mod publish;
pub mod reset;
pub mod watch;

use std::path::PathBuf;
use std::sync::Arc;

use af_agents::instance::InstanceContext;
use af_agents::storage::InstanceStore;
use af_core::config::Config;
use af_core::paths::DataDir;
use af_core::worktree_manager::WorkspaceManager;
use af_daemon::pidfile::{launch_daemon, stop_daemon};
use af_daemon::supervisor::{PollMode, Supervisor};
use af_session::tmux::RealTmux;
use anyhow::Context;
use tracing::info;

/// Everything a command needs: settings, paths and the shared instance
/// context backed by the real git, gh and tmux.
pub struct Farm {
    pub config: Config,
    pub data: DataDir,
    pub ctx: Arc<InstanceContext>,
}

impl Farm {
    pub fn new(config: Config, data: DataDir) -> Self {
        let ctx = Arc::new(InstanceContext {
            workspaces: Arc::new(WorkspaceManager::new(&data)),
            tmux: Arc::new(RealTmux),
            branch_prefix: config.branch_prefix.clone(),
        });
        Self { config, data, ctx }
    }

    /// Root of the git repository containing the current directory.
    pub fn require_repo(&self) -> anyhow::Result<PathBuf> {
        let cwd = std::env::current_dir().context("failed to read current directory")?;
        self.ctx
            .workspaces
            .repo_root(&cwd)
            .context("af must be run from within a git repository")
    }

    pub fn store(&self) -> InstanceStore {
        InstanceStore::new(self.data.state_file())
    }

    /// Load and restore every instance for foreground use.
    pub fn supervisor(&self) -> anyhow::Result<Supervisor> {
        Supervisor::load(Arc::clone(&self.ctx), self.store(), PollMode::Foreground)
            .context("failed to load instances")
    }
}

/// Keeps the daemon away from the instances while a command works on them.
///
/// [`begin`](Self::begin) stops a running daemon; [`finish`](Self::finish)
/// relaunches it when it was running before or auto-accept is on.
pub struct DaemonHandoff<'a> {
    data: &'a DataDir,
    relaunch: bool,
}

impl<'a> DaemonHandoff<'a> {
    pub fn begin(farm: &'a Farm) -> anyhow::Result<Self> {
        let was_running = stop_daemon(&farm.data).context("failed to stop the daemon")?;
        Ok(Self {
            data: &farm.data,
            relaunch: was_running || farm.config.auto_yes,
        })
    }

    pub fn finish(self) -> anyhow::Result<()> {
        if self.relaunch {
            let pid = launch_daemon(self.data).context("failed to launch the daemon")?;
            info!(pid, "daemon handed back the instances");
        }
        Ok(())
    }
}

/// Run `f` against the restored instance set, save it, and give it back to
/// the daemon. The set is saved even when `f` fails.
pub fn with_supervisor<T>(
    farm: &Farm,
    f: impl FnOnce(&mut Supervisor) -> anyhow::Result<T>,
) -> anyhow::Result<T> {
    let handoff = DaemonHandoff::begin(farm)?;
    let mut supervisor = farm.supervisor()?;
    let result = f(&mut supervisor);
    let saved = supervisor.save().context("failed to save instances");
    handoff.finish()?;
    let value = result?;
    saved?;
    Ok(value)
}
