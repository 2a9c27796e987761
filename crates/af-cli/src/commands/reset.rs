use af_session::tmux::cleanup_sessions;
use anyhow::Context;
use tracing::info;

use super::Farm;

/// Run the `reset` subcommand: stop the daemon and remove every instance,
/// `af_` session and worktree. `force` also drops the default-branch caches.
pub fn run(farm: &Farm, force: bool) -> anyhow::Result<()> {
    if af_daemon::pidfile::stop_daemon(&farm.data).context("failed to stop the daemon")? {
        println!("stopped daemon");
    }

    farm.store()
        .delete_all()
        .context("failed to clear stored instances")?;

    let sessions = cleanup_sessions(&farm.ctx.tmux).context("failed to kill sessions")?;
    let worktrees = farm
        .ctx
        .workspaces
        .cleanup_all()
        .context("failed to remove worktrees")?;

    if force {
        farm.ctx
            .workspaces
            .reset_all_repo_caches()
            .context("failed to reset repository caches")?;
        println!("cleared repository caches");
    }

    info!(sessions, worktrees, force, "reset complete");
    println!("removed {sessions} session(s) and {worktrees} worktree(s)");
    Ok(())
}
