use af_agents::instance::InstanceError;
use af_agents::storage::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Instance(#[from] InstanceError),

    #[error("no instance titled '{0}'")]
    UnknownInstance(String),

    #[error("daemon already running (pid={0})")]
    AlreadyRunning(u32),

    #[error("daemon (pid={0}) did not exit after SIGTERM")]
    StillRunning(u32),

    #[error("failed to signal daemon pid {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("poll worker failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, DaemonError>;
