//! Terminal sessions for agent-farm instances.
//!
//! Each instance runs its agent program inside a detached tmux session named
//! `af_<title>`. This crate wraps the tmux CLI behind [`tmux::TmuxRunner`],
//! knows how each supported agent program asks for confirmation
//! ([`program::ProgramKind`]), and samples captured screens so callers can
//! tell a busy agent from an idle one ([`monitor::OutputSampler`]).

pub mod monitor;
pub mod program;
pub mod tmux;

#[cfg(any(test, feature = "testing"))]
pub mod testing;
