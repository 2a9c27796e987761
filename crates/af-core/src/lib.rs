//! Core building blocks for agent-farm.
//!
//! - Configuration and the on-disk data directory
//! - Narrow runner traits over the external `git` and `gh` binaries
//! - A per-repository lock map that serialises mutating git sequences
//! - The workspace manager: one isolated worktree per agent branch, plus
//!   publish and rebase flows with automatic rollback
//! - The default-branch cache stored per repository

pub mod config;
pub mod error;
pub mod paths;
pub mod repo_config;
pub mod repo_lock;
pub mod runner;
pub mod worktree;
pub mod worktree_manager;

#[cfg(any(test, feature = "testing"))]
pub mod testing;
