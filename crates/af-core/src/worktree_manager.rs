use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::error::ErrorClass;
use crate::paths::DataDir;
use crate::repo_config::{RepoConfigError, RepoConfigStore};
use crate::repo_lock::RepoLocks;
use crate::runner::{GhCliRunner, GitRunner, PublishRunner, RealGitRunner, SpawnError, ToolOutput};
use crate::worktree::{worktree_dir_name, DiffStats, Worktree};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("git {command} failed: {output}")]
    Git { command: String, output: String },

    #[error("gh {command} failed: {output}")]
    Publish { command: String, output: String },

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("not a git repository: {0}")]
    NotAGitRepo(PathBuf),

    #[error("branch '{0}' is already checked out in another worktree")]
    BranchInUse(String),

    #[error("cannot rebase with uncommitted changes; commit or stash them first")]
    Dirty,

    #[error("worktree not found: {0}")]
    NotFound(PathBuf),

    #[error("could not determine default branch: {0}")]
    DefaultBranch(String),

    #[error("rebase failed and was aborted: {output}")]
    RebaseFailed { output: String },

    #[error("rebase failed ({output}) and the abort also failed ({abort_output}); the worktree may be mid-rebase")]
    RebaseAbortFailed { output: String, abort_output: String },

    #[error(transparent)]
    RepoConfig(#[from] RepoConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkspaceError {
    pub fn class(&self) -> ErrorClass {
        match self {
            WorkspaceError::Git { .. }
            | WorkspaceError::Publish { .. }
            | WorkspaceError::DefaultBranch(_) => ErrorClass::ExternalTool,
            WorkspaceError::Spawn(SpawnError::NotInstalled(_)) => ErrorClass::ResourceAbsence,
            WorkspaceError::Spawn(SpawnError::Io { .. }) => ErrorClass::Io,
            WorkspaceError::NotAGitRepo(_)
            | WorkspaceError::BranchInUse(_)
            | WorkspaceError::Dirty => ErrorClass::Precondition,
            WorkspaceError::NotFound(_) => ErrorClass::ResourceAbsence,
            WorkspaceError::RebaseFailed { .. } | WorkspaceError::RebaseAbortFailed { .. } => {
                ErrorClass::PartialFailure
            }
            WorkspaceError::RepoConfig(_) | WorkspaceError::Io(_) => ErrorClass::Io,
        }
    }

    /// Captured tool output carried by the error, if any.
    pub fn output(&self) -> Option<&str> {
        match self {
            WorkspaceError::Git { output, .. }
            | WorkspaceError::Publish { output, .. }
            | WorkspaceError::RebaseFailed { output }
            | WorkspaceError::RebaseAbortFailed { output, .. } => Some(output),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, WorkspaceError>;

// ---------------------------------------------------------------------------
// WorkspaceManager
// ---------------------------------------------------------------------------

/// Creates, tears down, publishes and rebases agent workspaces.
///
/// Every mutating sequence of git invocations against one repository runs
/// under that repository's entry in [`RepoLocks`]. Read-only probes
/// (`is_dirty`, `is_branch_checked_out`, `repo_root`) run unlocked.
pub struct WorkspaceManager {
    git: Arc<dyn GitRunner>,
    publisher: Arc<dyn PublishRunner>,
    locks: Arc<RepoLocks>,
    repo_configs: RepoConfigStore,
    worktrees_dir: PathBuf,
}

impl WorkspaceManager {
    /// Manager backed by the real `git` and `gh` binaries.
    pub fn new(data: &DataDir) -> Self {
        Self::with_runners(data, Arc::new(RealGitRunner), Arc::new(GhCliRunner))
    }

    /// Manager with custom runners (for testing).
    pub fn with_runners(
        data: &DataDir,
        git: Arc<dyn GitRunner>,
        publisher: Arc<dyn PublishRunner>,
    ) -> Self {
        Self {
            git,
            publisher,
            locks: RepoLocks::global(),
            repo_configs: RepoConfigStore::new(data.repos_file()),
            worktrees_dir: data.worktrees_dir(),
        }
    }

    /// Replace the process-wide lock map.
    pub fn with_locks(mut self, locks: Arc<RepoLocks>) -> Self {
        self.locks = locks;
        self
    }

    pub fn worktrees_dir(&self) -> &Path {
        &self.worktrees_dir
    }

    pub fn repo_configs(&self) -> &RepoConfigStore {
        &self.repo_configs
    }

    // -- queries --------------------------------------------------------------

    /// Top-level directory of the repository containing `path`.
    pub fn repo_root(&self, path: &Path) -> Result<PathBuf> {
        let out = self.git.run_git(path, &["rev-parse", "--show-toplevel"])?;
        if !out.success {
            debug!(path = %path.display(), output = %out.combined(), "not inside a git repository");
            return Err(WorkspaceError::NotAGitRepo(path.to_path_buf()));
        }
        Ok(PathBuf::from(out.stdout.trim()))
    }

    pub fn is_git_repo(&self, path: &Path) -> bool {
        self.repo_root(path).is_ok()
    }

    /// True iff the workspace has uncommitted or untracked changes.
    pub fn is_dirty(&self, wt: &Worktree) -> Result<bool> {
        if !wt.exists_on_disk() {
            return Err(WorkspaceError::NotFound(wt.worktree_path.clone()));
        }
        let status = self.git_ok(&wt.worktree_path, &["status", "--porcelain"])?;
        Ok(!status.trim().is_empty())
    }

    /// True iff `branch` is the branch checked out in the main repository.
    pub fn is_branch_checked_out(&self, repo: &Path, branch: &str) -> Result<bool> {
        let current = self.git_ok(repo, &["branch", "--show-current"])?;
        Ok(current.trim() == branch)
    }

    // -- lifecycle ------------------------------------------------------------

    /// Create a worktree for `branch`, creating the branch from HEAD if needed.
    ///
    /// An existing branch is reused, unless some worktree (the main one
    /// included) already has it checked out.
    pub fn create(&self, repo: &Path, branch: &str) -> Result<Worktree> {
        let repo_root = self.repo_root(repo)?;
        let worktree_path = self.new_worktree_path(branch);

        info!(
            repo = %repo_root.display(),
            branch,
            worktree = %worktree_path.display(),
            "creating workspace"
        );

        self.locks.with_lock(&repo_root, || -> Result<Worktree> {
            std::fs::create_dir_all(&self.worktrees_dir)?;
            let path_arg = worktree_path.to_string_lossy().into_owned();
            let head = self.git_ok(&repo_root, &["rev-parse", "HEAD"])?.trim().to_string();

            let base_commit = if self.branch_exists(&repo_root, branch)? {
                if self.branch_in_any_worktree(&repo_root, branch)? {
                    return Err(WorkspaceError::BranchInUse(branch.to_string()));
                }
                self.git_ok(&repo_root, &["worktree", "add", &path_arg, branch])?;
                self.merge_base(&repo_root, &head, branch).unwrap_or(head)
            } else {
                self.git_ok(&repo_root, &["worktree", "add", "-b", branch, &path_arg, &head])?;
                head
            };

            Ok(Worktree {
                repo_path: repo_root.clone(),
                worktree_path: worktree_path.clone(),
                branch: branch.to_string(),
                base_commit,
            })
        })
    }

    /// Re-bind the worktree directory to its retained branch.
    ///
    /// A worktree still present on disk is reused. Otherwise stale
    /// registrations are pruned and the worktree is added again at the same
    /// path; a branch that has vanished is recreated from the base commit.
    pub fn reattach(&self, wt: &Worktree) -> Result<()> {
        self.locks.with_lock(&wt.repo_path, || -> Result<()> {
            if wt.exists_on_disk() {
                debug!(worktree = %wt.worktree_path.display(), "worktree already present");
                return Ok(());
            }
            info!(branch = %wt.branch, worktree = %wt.worktree_path.display(), "reattaching workspace");
            self.git_ok(&wt.repo_path, &["worktree", "prune"])?;
            if let Some(parent) = wt.worktree_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let path_arg = wt.worktree_path.to_string_lossy().into_owned();

            if self.branch_exists(&wt.repo_path, &wt.branch)? {
                if self.branch_in_any_worktree(&wt.repo_path, &wt.branch)? {
                    return Err(WorkspaceError::BranchInUse(wt.branch.clone()));
                }
                self.git_ok(&wt.repo_path, &["worktree", "add", &path_arg, &wt.branch])?;
            } else {
                warn!(branch = %wt.branch, "branch missing, recreating from base commit");
                self.git_ok(
                    &wt.repo_path,
                    &["worktree", "add", "-b", &wt.branch, &path_arg, &wt.base_commit],
                )?;
            }
            Ok(())
        })
    }

    /// Delete the worktree directory. The branch is kept.
    pub fn remove(&self, wt: &Worktree) -> Result<()> {
        self.locks
            .with_lock(&wt.repo_path, || self.remove_unlocked(wt))
    }

    /// Remove the worktree, delete its branch and prune.
    pub fn cleanup(&self, wt: &Worktree) -> Result<()> {
        self.locks.with_lock(&wt.repo_path, || -> Result<()> {
            self.remove_unlocked(wt)?;
            if self.branch_exists(&wt.repo_path, &wt.branch)? {
                self.git_ok(&wt.repo_path, &["branch", "-D", &wt.branch])?;
            }
            self.git_ok(&wt.repo_path, &["worktree", "prune"])?;
            info!(branch = %wt.branch, "workspace cleaned up");
            Ok(())
        })
    }

    /// Remove every worktree under the worktrees directory along with its
    /// branch. Returns how many directories were removed.
    pub fn cleanup_all(&self) -> Result<usize> {
        let entries = match std::fs::read_dir(&self.worktrees_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        for entry in entries {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            if let Err(e) = self.cleanup_dir(&path) {
                warn!(worktree = %path.display(), error = %e, "git cleanup failed, deleting directory");
            }
            if path.exists() {
                std::fs::remove_dir_all(&path)?;
            }
            removed += 1;
        }
        info!(removed, "removed all workspaces");
        Ok(removed)
    }

    /// Stage and commit everything (hooks bypassed) if the workspace is dirty.
    /// Returns whether a commit was made.
    pub fn commit_all(&self, wt: &Worktree, message: &str) -> Result<bool> {
        self.locks
            .with_lock(&wt.repo_path, || self.commit_all_unlocked(wt, message))
    }

    // -- publishing -----------------------------------------------------------

    /// Commit pending changes, then publish the branch to the remote.
    ///
    /// Publishing tries `gh repo sync` first; if that fails (typically because
    /// the branch does not exist remotely yet) it pushes with upstream
    /// tracking and syncs again. Opening the branch in a browser is best
    /// effort.
    pub fn push(&self, wt: &Worktree, message: &str, open: bool) -> Result<()> {
        self.locks.with_lock(&wt.repo_path, || -> Result<()> {
            if !self.commit_all_unlocked(wt, message)? {
                debug!(branch = %wt.branch, "nothing to commit, publishing anyway");
            }
            self.publish_unlocked(wt)
        })?;
        info!(branch = %wt.branch, "branch published");

        if open {
            if let Err(e) = self.gh_ok(&wt.worktree_path, &["browse", "--branch", &wt.branch]) {
                warn!(branch = %wt.branch, error = %e, "failed to open branch in browser");
            }
        }
        Ok(())
    }

    /// Rebase the workspace branch onto the tip of the remote default branch.
    ///
    /// Refuses when dirty. On any rebase failure the rebase is aborted so the
    /// worktree returns to its previous state before the error is returned.
    pub fn rebase_onto_default(&self, wt: &Worktree) -> Result<()> {
        self.locks.with_lock(&wt.repo_path, || -> Result<()> {
            if self.is_dirty(wt)? {
                return Err(WorkspaceError::Dirty);
            }
            let default_branch = self.default_branch(&wt.repo_path)?;
            let remote_ref = format!("origin/{default_branch}");
            let dir = wt.worktree_path.as_path();

            self.git_ok(dir, &["fetch", "origin", &default_branch])?;
            let current = self
                .git_ok(dir, &["rev-parse", "--abbrev-ref", "HEAD"])?
                .trim()
                .to_string();

            let fork_point = match self.git_ok(dir, &["merge-base", "--fork-point", &remote_ref]) {
                Ok(out) if !out.trim().is_empty() => out.trim().to_string(),
                Ok(_) | Err(_) => {
                    debug!(branch = %current, "no fork point, falling back to merge-base");
                    self.git_ok(dir, &["merge-base", &remote_ref, &current])?
                        .trim()
                        .to_string()
                }
            };

            info!(branch = %current, onto = %remote_ref, fork_point = %fork_point, "rebasing");
            let out = self
                .git
                .run_git(dir, &["rebase", "--onto", &remote_ref, &fork_point, &current])?;
            if out.success {
                return Ok(());
            }

            let output = out.combined();
            warn!(branch = %current, output = %output, "rebase failed, aborting");
            let abort = match self.git.run_git(dir, &["rebase", "--abort"]) {
                Ok(abort) => abort,
                Err(e) => {
                    error!(branch = %current, error = %e, "rebase abort could not run");
                    return Err(WorkspaceError::RebaseAbortFailed {
                        output,
                        abort_output: e.to_string(),
                    });
                }
            };
            if abort.success {
                Err(WorkspaceError::RebaseFailed { output })
            } else {
                let abort_output = abort.combined();
                error!(branch = %current, output = %abort_output, "rebase abort failed");
                Err(WorkspaceError::RebaseAbortFailed {
                    output,
                    abort_output,
                })
            }
        })
    }

    /// Changes in the workspace relative to `merge-base(base_commit, HEAD)`.
    ///
    /// Untracked files are marked intent-to-add first so they show up.
    pub fn diff_stats(&self, wt: &Worktree) -> Result<DiffStats> {
        if !wt.exists_on_disk() {
            return Err(WorkspaceError::NotFound(wt.worktree_path.clone()));
        }
        self.locks.with_lock(&wt.repo_path, || -> Result<DiffStats> {
            let dir = wt.worktree_path.as_path();
            self.git_ok(dir, &["add", "-N", "."])?;
            let base = self
                .merge_base(dir, &wt.base_commit, "HEAD")
                .unwrap_or_else(|| wt.base_commit.clone());
            let diff = self.git_ok(dir, &["--no-pager", "diff", &base])?;
            Ok(DiffStats::parse(&diff))
        })
    }

    // -- default-branch cache -------------------------------------------------

    /// The remote default branch of `repo`, read from the cache or, on a miss,
    /// from `git remote show origin` (and then cached).
    pub fn default_branch(&self, repo: &Path) -> Result<String> {
        if let Some(cached) = self.repo_configs.load(repo)? {
            if !cached.default_branch.is_empty() {
                return Ok(cached.default_branch);
            }
        }

        let out = self.git_ok(repo, &["remote", "show", "origin"])?;
        let branch = parse_head_branch(&out).ok_or_else(|| {
            WorkspaceError::DefaultBranch(format!(
                "no HEAD branch reported for origin of {}",
                repo.display()
            ))
        })?;

        if let Err(e) = self.repo_configs.save_default_branch(repo, &branch) {
            warn!(repo = %repo.display(), error = %e, "failed to cache default branch");
        }
        Ok(branch)
    }

    /// Forget the cached default branch for one repository.
    pub fn reset_repo_cache(&self, repo: &Path) -> Result<bool> {
        Ok(self.repo_configs.delete(repo)?)
    }

    /// Forget every cached repository record.
    pub fn reset_all_repo_caches(&self) -> Result<()> {
        Ok(self.repo_configs.delete_all()?)
    }

    // -- internals ------------------------------------------------------------

    fn new_worktree_path(&self, branch: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        self.worktrees_dir.join(worktree_dir_name(branch, nanos))
    }

    fn remove_unlocked(&self, wt: &Worktree) -> Result<()> {
        if wt.exists_on_disk() {
            let path_arg = wt.worktree_path.to_string_lossy().into_owned();
            self.git_ok(&wt.repo_path, &["worktree", "remove", "-f", &path_arg])?;
        } else {
            debug!(worktree = %wt.worktree_path.display(), "worktree already gone");
        }
        self.git_ok(&wt.repo_path, &["worktree", "prune"])?;
        info!(branch = %wt.branch, "workspace removed");
        Ok(())
    }

    fn commit_all_unlocked(&self, wt: &Worktree, message: &str) -> Result<bool> {
        if !self.is_dirty(wt)? {
            return Ok(false);
        }
        let dir = wt.worktree_path.as_path();
        self.git_ok(dir, &["add", "."])?;
        self.git_ok(dir, &["commit", "-m", message, "--no-verify"])?;
        info!(branch = %wt.branch, "committed workspace changes");
        Ok(true)
    }

    fn publish_unlocked(&self, wt: &Worktree) -> Result<()> {
        let dir = wt.worktree_path.as_path();
        let sync = ["repo", "sync", "-b", wt.branch.as_str()];
        match self.gh_ok(dir, &sync) {
            Ok(_) => Ok(()),
            Err(e) => {
                debug!(branch = %wt.branch, error = %e, "sync failed, pushing branch");
                self.git_ok(dir, &["push", "-u", "origin", &wt.branch])?;
                self.gh_ok(dir, &sync)?;
                Ok(())
            }
        }
    }

    fn cleanup_dir(&self, path: &Path) -> Result<()> {
        let common = self.git_ok(path, &["rev-parse", "--git-common-dir"])?;
        let common = PathBuf::from(common.trim());
        let common = if common.is_absolute() {
            common
        } else {
            path.join(common)
        };
        let repo = common
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| WorkspaceError::NotAGitRepo(path.to_path_buf()))?;
        let branch = self
            .git_ok(path, &["rev-parse", "--abbrev-ref", "HEAD"])?
            .trim()
            .to_string();

        let wt = Worktree {
            repo_path: repo,
            worktree_path: path.to_path_buf(),
            branch,
            base_commit: String::new(),
        };
        self.cleanup(&wt)
    }

    fn branch_exists(&self, repo: &Path, branch: &str) -> Result<bool> {
        let reference = format!("refs/heads/{branch}");
        let out = self
            .git
            .run_git(repo, &["show-ref", "--verify", "--quiet", &reference])?;
        Ok(out.success)
    }

    fn branch_in_any_worktree(&self, repo: &Path, branch: &str) -> Result<bool> {
        let listing = self.git_ok(repo, &["worktree", "list", "--porcelain"])?;
        let needle = format!("branch refs/heads/{branch}");
        Ok(listing.lines().any(|line| line.trim() == needle))
    }

    fn merge_base(&self, dir: &Path, a: &str, b: &str) -> Option<String> {
        match self.git_ok(dir, &["merge-base", a, b]) {
            Ok(out) if !out.trim().is_empty() => Some(out.trim().to_string()),
            _ => None,
        }
    }

    /// Run git and map a non-zero exit to [`WorkspaceError::Git`].
    fn git_ok(&self, dir: &Path, args: &[&str]) -> Result<String> {
        let out = self.git.run_git(dir, args)?;
        check("git", args, out).map_err(|(command, output)| WorkspaceError::Git { command, output })
    }

    fn gh_ok(&self, dir: &Path, args: &[&str]) -> Result<String> {
        let out = self.publisher.run_gh(dir, args)?;
        check("gh", args, out)
            .map_err(|(command, output)| WorkspaceError::Publish { command, output })
    }
}

fn check(
    tool: &str,
    args: &[&str],
    out: ToolOutput,
) -> std::result::Result<String, (String, String)> {
    if out.success {
        return Ok(out.stdout);
    }
    let command = args.join(" ");
    let output = out.combined();
    error!(tool, command = %command, output = %output, "command failed");
    Err((command, output))
}

/// Extract the branch from the `HEAD branch: <name>` line.
pub fn parse_head_branch(remote_show: &str) -> Option<String> {
    remote_show
        .lines()
        .find_map(|line| line.trim().strip_prefix("HEAD branch:"))
        .map(|rest| rest.trim().to_string())
        .filter(|name| !name.is_empty() && name != "(unknown)")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
