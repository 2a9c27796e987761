use af_daemon::daemon::PollLoop;
use af_daemon::shutdown::install_signal_handlers;
use af_daemon::supervisor::Supervisor;
use anyhow::Context;

use super::list::{render, Row};
use super::{DaemonHandoff, Farm};

/// Run the foreground control loop.
///
/// Any daemon is stopped first so only one process polls. On ctrl-c the
/// instances are saved and, with auto-accept on, the daemon takes over again.
pub async fn run(farm: &Farm) -> anyhow::Result<()> {
    let handoff = DaemonHandoff::begin(farm)?;
    let supervisor = farm.supervisor()?;
    println!(
        "watching {} instance(s) every {}ms, ctrl-c to stop",
        supervisor.instances().len(),
        farm.config.daemon_poll_interval_ms
    );

    let poll = PollLoop::new(supervisor, farm.config.poll_interval());
    install_signal_handlers(poll.shutdown_handle()).context("failed to install signal handlers")?;

    let mut last = String::new();
    poll.run_with(|sup, _report| {
        let table = status_table(sup);
        if table != last {
            print!("{table}");
            last = table;
        }
    })
    .await
    .context("watch loop failed")?;

    handoff.finish()?;
    if farm.config.auto_yes {
        println!("auto-accept is on; the daemon keeps polling in the background");
    }
    Ok(())
}

fn status_table(sup: &Supervisor) -> String {
    let rows: Vec<Row> = sup.instances().iter().map(Row::from_instance).collect();
    render(&rows)
}
