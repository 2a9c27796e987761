mod commands;

use af_core::config::Config;
use af_core::paths::DataDir;
use anyhow::Context;
use clap::{Parser, Subcommand};

use commands::Farm;

/// agent-farm -- run coding agents side by side, each on its own branch,
/// worktree and tmux session.
#[derive(Parser)]
#[command(name = "af", version, about)]
struct Cli {
    /// Program to run in new instances (default: `default_program` from config).
    #[arg(short, long, global = true)]
    program: Option<String>,

    /// Auto-accept agent prompts, and keep a background daemon doing so
    /// after `af` exits.
    #[arg(short = 'y', long = "autoyes", global = true)]
    autoyes: bool,

    /// Run as the background daemon.
    #[arg(long, hide = true)]
    daemon: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll every instance in the foreground (default when no subcommand is given).
    Watch,

    /// Create an instance and start its agent.
    New {
        /// Instance title; also names the branch.
        title: String,
        /// Initial prompt typed into the agent once it is up.
        #[arg(long)]
        prompt: Option<String>,
    },

    /// List instances.
    List {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Attach to an instance's session (detach with ctrl-b d).
    Attach { title: String },

    /// Open a shell in an instance's worktree.
    Shell { title: String },

    /// Send a prompt to a running instance.
    Prompt { title: String, text: String },

    /// Commit work, then remove the worktree and session. The branch stays.
    Pause { title: String },

    /// Bring a paused instance back on its branch.
    Resume { title: String },

    /// Remove an instance with its worktree, session and branch.
    Kill { title: String },

    /// Commit everything and publish the branch.
    Push {
        title: String,
        /// Commit message.
        #[arg(short, long)]
        message: Option<String>,
        /// Open the branch in the browser afterwards.
        #[arg(long)]
        open: bool,
    },

    /// Rebase an instance's branch onto the remote default branch.
    Rebase { title: String },

    /// Remove all instances, sessions and worktrees, and stop the daemon.
    Reset {
        /// Also forget the cached default branches.
        #[arg(long)]
        force: bool,
    },

    /// Show where configuration lives and what is in effect.
    Debug,

    /// Print the version.
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let data = DataDir::resolve();
    data.ensure()
        .with_context(|| format!("failed to create {}", data.root().display()))?;
    let loaded = Config::load(&data);
    let level = loaded
        .as_ref()
        .map(|c| c.log_level.clone())
        .unwrap_or_else(|_| "info".into());
    let service = if cli.daemon { "af-daemon" } else { "af" };
    af_telemetry::logging::init_file_logging(service, &level, data.log_file())
        .with_context(|| format!("failed to open {}", data.log_file().display()))?;

    let mut config = loaded.unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        Config::default()
    });
    if let Some(program) = cli.program {
        config.default_program = program;
    }
    if cli.autoyes {
        config.auto_yes = true;
    }

    if cli.daemon {
        af_daemon::daemon::run_daemon(config, data)
            .await
            .context("daemon failed")?;
        return Ok(());
    }

    let farm = Farm::new(config, data);
    match cli.command {
        None | Some(Commands::Watch) => {
            farm.require_repo()?;
            commands::watch::run(&farm).await?;
        }
        Some(Commands::New { title, prompt }) => {
            let repo = farm.require_repo()?;
            commands::new::run(&farm, &repo, &title, prompt.as_deref())?;
        }
        Some(Commands::List { json }) => {
            farm.require_repo()?;
            commands::list::run(&farm, json)?;
        }
        Some(Commands::Attach { title }) => {
            farm.require_repo()?;
            commands::lifecycle::attach(&farm, &title)?;
        }
        Some(Commands::Shell { title }) => {
            farm.require_repo()?;
            commands::lifecycle::shell(&farm, &title)?;
        }
        Some(Commands::Prompt { title, text }) => {
            farm.require_repo()?;
            commands::lifecycle::prompt(&farm, &title, &text)?;
        }
        Some(Commands::Pause { title }) => {
            farm.require_repo()?;
            commands::lifecycle::pause(&farm, &title)?;
        }
        Some(Commands::Resume { title }) => {
            farm.require_repo()?;
            commands::lifecycle::resume(&farm, &title)?;
        }
        Some(Commands::Kill { title }) => {
            farm.require_repo()?;
            commands::lifecycle::kill(&farm, &title)?;
        }
        Some(Commands::Push {
            title,
            message,
            open,
        }) => {
            farm.require_repo()?;
            commands::publish::push(&farm, &title, message.as_deref(), open)?;
        }
        Some(Commands::Rebase { title }) => {
            farm.require_repo()?;
            commands::publish::rebase(&farm, &title).await?;
        }
        Some(Commands::Reset { force }) => {
            commands::reset::run(&farm, force)?;
        }
        Some(Commands::Debug) => {
            commands::debug::run(&farm)?;
        }
        Some(Commands::Version) => {
            println!("af version {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn bare_invocation_watches() {
        let cli = Cli::try_parse_from(["af"]).unwrap();
        assert!(cli.command.is_none());
        assert!(!cli.daemon);
    }

    #[test]
    fn global_flags_work_after_subcommands() {
        let cli = Cli::try_parse_from(["af", "new", "feat-x", "-y", "-p", "aider"]).unwrap();
        assert!(cli.autoyes);
        assert_eq!(cli.program.as_deref(), Some("aider"));
        match cli.command {
            Some(Commands::New { title, prompt }) => {
                assert_eq!(title, "feat-x");
                assert!(prompt.is_none());
            }
            _ => panic!("expected new"),
        }
    }

    #[test]
    fn push_takes_message_and_open() {
        let cli = Cli::try_parse_from(["af", "push", "feat-x", "-m", "wip", "--open"]).unwrap();
        match cli.command {
            Some(Commands::Push {
                title,
                message,
                open,
            }) => {
                assert_eq!(title, "feat-x");
                assert_eq!(message.as_deref(), Some("wip"));
                assert!(open);
            }
            _ => panic!("expected push"),
        }
    }

    #[test]
    fn daemon_flag_is_hidden_but_accepted() {
        let cli = Cli::try_parse_from(["af", "--daemon"]).unwrap();
        assert!(cli.daemon);
        let help = Cli::command().render_long_help().to_string();
        assert!(!help.contains("--daemon"));
    }
}
