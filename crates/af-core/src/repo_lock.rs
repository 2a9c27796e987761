use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use dashmap::DashMap;
use tracing::trace;

/// Mutual-exclusion keyed by repository.
///
/// Every mutating git sequence against a repository (worktree add/remove,
/// commit, push, rebase, diff staging) runs inside [`RepoLocks::with_lock`],
/// so sequences against the same repository never interleave while sequences
/// against different repositories proceed in parallel. Keys are canonical
/// paths, so two spellings of the same directory share one lock.
#[derive(Debug, Default)]
pub struct RepoLocks {
    locks: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl RepoLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide lock map shared by every workspace manager.
    pub fn global() -> Arc<RepoLocks> {
        static GLOBAL: OnceLock<Arc<RepoLocks>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(RepoLocks::new())))
    }

    /// Run `f` while holding the lock for `repo`.
    ///
    /// Not re-entrant: `f` must not call back into `with_lock` for the same
    /// repository.
    pub fn with_lock<T>(&self, repo: &Path, f: impl FnOnce() -> T) -> T {
        let key = Self::key(repo);
        let lock = {
            let entry = self
                .locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())));
            Arc::clone(entry.value())
        };
        // A panic inside another holder leaves no state behind the `()`.
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        trace!(repo = %key.display(), "repository lock acquired");
        f()
    }

    /// Number of repositories that have been locked at least once.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    fn key(repo: &Path) -> PathBuf {
        repo.canonicalize().unwrap_or_else(|_| repo.to_path_buf())
    }
}
