use std::sync::Arc;
use std::time::Duration;

use af_agents::instance::InstanceContext;
use af_agents::storage::InstanceStore;
use af_core::config::Config;
use af_core::paths::DataDir;
use af_core::worktree_manager::WorkspaceManager;
use af_session::tmux::RealTmux;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::error::Result;
use crate::pidfile::PidFile;
use crate::shutdown::{install_signal_handlers, ShutdownSignal};
use crate::supervisor::{PollMode, Supervisor, TickReport};

/// Fixed-interval polling over a [`Supervisor`] until shutdown.
///
/// Ticks run on the blocking pool, one at a time, since every poll shells
/// out to tmux and git.
pub struct PollLoop {
    supervisor: Supervisor,
    interval: Duration,
    shutdown: ShutdownSignal,
}

impl PollLoop {
    pub fn new(supervisor: Supervisor, interval: Duration) -> Self {
        Self {
            supervisor,
            interval,
            shutdown: ShutdownSignal::new(),
        }
    }

    /// Returns a handle that can be used to trigger shutdown from another task.
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Run until shutdown, then save and hand the supervisor back.
    pub async fn run(self) -> Result<Supervisor> {
        self.run_with(|_, _| {}).await
    }

    /// Like [`run`](Self::run), calling `on_tick` after every pass.
    pub async fn run_with<F>(self, mut on_tick: F) -> Result<Supervisor>
    where
        F: FnMut(&Supervisor, &TickReport),
    {
        let Self {
            mut supervisor,
            interval,
            shutdown,
        } = self;

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Consume the first immediate tick.
        ticker.tick().await;

        let mut shutdown_rx = shutdown.subscribe();
        info!(
            mode = %supervisor.mode(),
            interval_ms = interval.as_millis() as u64,
            "poll loop started"
        );

        while !shutdown.is_shutting_down() {
            tokio::select! {
                _ = ticker.tick() => {
                    let (next, report) = tick_blocking(supervisor).await?;
                    supervisor = next;
                    on_tick(&supervisor, &report);
                }
                _ = shutdown_rx.recv() => {
                    info!("poll loop received shutdown signal");
                    break;
                }
            }
        }

        supervisor.save()?;
        info!(instances = supervisor.instances().len(), "poll loop stopped, state saved");
        Ok(supervisor)
    }
}

async fn tick_blocking(mut supervisor: Supervisor) -> Result<(Supervisor, TickReport)> {
    let joined = tokio::task::spawn_blocking(move || {
        let report = supervisor.tick();
        (supervisor, report)
    })
    .await?;
    Ok(joined)
}

/// Entry point of `af --daemon`.
///
/// Takes the pid file, restores every instance with auto-accept forced on,
/// polls until SIGINT/SIGTERM, saves, and releases the pid file.
pub async fn run_daemon(config: Config, data: DataDir) -> Result<()> {
    data.ensure()?;
    let pid_path = data.pid_file();
    PidFile::current().acquire_or_fail(&pid_path)?;
    info!(pid = std::process::id(), root = %data.root().display(), "daemon starting");

    let result = serve(config, data).await;
    if let Err(e) = &result {
        warn!(error = %e, "daemon exiting with error");
    }

    if PidFile::read(&pid_path).is_some_and(|pf| pf.pid == std::process::id()) {
        PidFile::remove(&pid_path);
    }
    result
}

async fn serve(config: Config, data: DataDir) -> Result<()> {
    let ctx = Arc::new(InstanceContext {
        workspaces: Arc::new(WorkspaceManager::new(&data)),
        tmux: Arc::new(RealTmux),
        branch_prefix: config.branch_prefix.clone(),
    });
    let store = InstanceStore::new(data.state_file());
    let supervisor =
        tokio::task::spawn_blocking(move || Supervisor::load(ctx, store, PollMode::Daemon)).await??;

    let poll = PollLoop::new(supervisor, config.poll_interval());
    install_signal_handlers(poll.shutdown_handle())?;
    poll.run().await?;
    Ok(())
}
