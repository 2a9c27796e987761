//! Background supervision for agent-farm instances.
//!
//! [`supervisor::Supervisor`] owns the instance set and performs one polling
//! pass per tick. [`daemon::PollLoop`] drives it on a fixed interval until a
//! [`shutdown::ShutdownSignal`] fires, and [`pidfile`] implements the
//! stop/relaunch handoff between the foreground `af` process and the
//! detached daemon.

pub mod daemon;
pub mod error;
pub mod pidfile;
pub mod shutdown;
pub mod supervisor;

pub use error::{DaemonError, Result};
