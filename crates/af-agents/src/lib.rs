//! Supervised agent instances.
//!
//! An [`instance::Instance`] binds one task to one branch, one worktree and
//! one tmux session. Its status is inferred by sampling the session's screen
//! (see [`state_machine::decide`]); lifecycle operations (pause, resume,
//! kill, push, rebase) go through the workspace manager. Instances are
//! persisted as [`storage::InstanceRecord`]s so they survive restarts.

pub mod instance;
pub mod state_machine;
pub mod storage;
