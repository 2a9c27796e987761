use af_daemon::supervisor::Supervisor;
use anyhow::Context;
use tracing::info;

use super::{DaemonHandoff, Farm};

/// Run the `push` subcommand: commit pending work and publish the branch.
pub fn push(farm: &Farm, title: &str, message: Option<&str>, open: bool) -> anyhow::Result<()> {
    super::with_supervisor(farm, |sup| {
        let inst = sup.get(title)?;
        inst.push(message, open)
            .with_context(|| format!("failed to push '{title}'"))?;
        println!("pushed {}", inst.branch());
        Ok(())
    })
}

/// Completion message from the rebase worker.
#[derive(Debug)]
struct RebaseDone {
    title: String,
    result: Result<(), String>,
}

/// Run the `rebase` subcommand.
///
/// The fetch and rebase block for as long as git takes, so they run on the
/// blocking pool and report back over a channel.
pub async fn rebase(farm: &Farm, title: &str) -> anyhow::Result<()> {
    let handoff = DaemonHandoff::begin(farm)?;
    let supervisor = farm.supervisor()?;

    let (tx, rx) = flume::bounded::<RebaseDone>(1);
    let worker_title = title.to_string();
    let worker = tokio::task::spawn_blocking(move || {
        let result = rebase_one(&supervisor, &worker_title);
        let _ = tx.send(RebaseDone {
            title: worker_title,
            result,
        });
        supervisor
    });

    println!("rebasing '{title}' onto the default branch...");
    let done = rx.recv_async().await.context("rebase worker went away")?;
    let supervisor = worker.await.context("rebase worker panicked")?;
    supervisor.save().context("failed to save instances")?;
    handoff.finish()?;

    match done.result {
        Ok(()) => {
            info!(title = %done.title, "rebase finished");
            println!("rebased '{}'", done.title);
            Ok(())
        }
        Err(e) => anyhow::bail!("rebase of '{}' failed: {e}", done.title),
    }
}

fn rebase_one(supervisor: &Supervisor, title: &str) -> Result<(), String> {
    let inst = supervisor.get(title).map_err(|e| e.to_string())?;
    inst.rebase().map_err(|e| e.to_string())
}
