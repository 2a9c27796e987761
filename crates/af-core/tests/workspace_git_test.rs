//! Workspace lifecycle against a real git binary. Skips when git is missing.

use std::path::Path;
use std::process::Command;

use af_core::paths::DataDir;
use af_core::worktree_manager::{WorkspaceError, WorkspaceManager};

fn git_available() -> bool {
    Command::new("git").arg("--version").output().is_ok()
}

fn isolate_git_env() {
    std::env::set_var("GIT_AUTHOR_NAME", "af-test");
    std::env::set_var("GIT_AUTHOR_EMAIL", "af-test@example.com");
    std::env::set_var("GIT_COMMITTER_NAME", "af-test");
    std::env::set_var("GIT_COMMITTER_EMAIL", "af-test@example.com");
    std::env::set_var("GIT_CONFIG_NOSYSTEM", "1");
    std::env::set_var("GIT_CONFIG_GLOBAL", "/dev/null");
}

fn git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .output()
        .unwrap();
    assert!(
        out.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

/// A main repository with one commit on `main`, pushed to a bare `origin`.
fn init_repo(root: &Path) -> std::path::PathBuf {
    let origin = root.join("origin.git");
    let repo = root.join("repo");
    std::fs::create_dir_all(&origin).unwrap();
    std::fs::create_dir_all(&repo).unwrap();

    git(&origin, &["init", "--bare", "-b", "main"]);
    git(&repo, &["init", "-b", "main"]);
    std::fs::write(repo.join("a.txt"), "base\n").unwrap();
    git(&repo, &["add", "."]);
    git(&repo, &["commit", "-m", "base"]);
    git(&repo, &["remote", "add", "origin", origin.to_str().unwrap()]);
    git(&repo, &["push", "-u", "origin", "main"]);
    repo
}

#[test]
fn create_then_remove_keeps_branch() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    isolate_git_env();
    let tmp = tempfile::tempdir().unwrap();
    let repo = init_repo(tmp.path());
    let mgr = WorkspaceManager::new(&DataDir::new(tmp.path().join("data")));

    let wt = mgr.create(&repo, "af/feature").unwrap();
    assert!(wt.exists_on_disk());
    assert!(!mgr.is_dirty(&wt).unwrap());
    assert!(!mgr.is_branch_checked_out(&repo, "af/feature").unwrap());

    std::fs::write(wt.worktree_path.join("new.txt"), "hello\n").unwrap();
    assert!(mgr.is_dirty(&wt).unwrap());
    let stats = mgr.diff_stats(&wt).unwrap();
    assert_eq!(stats.added, 1);
    assert!(mgr.commit_all(&wt, "add new.txt").unwrap());

    mgr.remove(&wt).unwrap();
    assert!(!wt.exists_on_disk());
    git(&repo, &["show-ref", "--verify", "refs/heads/af/feature"]);
    let listing = git(&repo, &["worktree", "list", "--porcelain"]);
    assert!(!listing.contains("refs/heads/af/feature"));

    // Resume path: the retained branch binds to a fresh worktree.
    mgr.reattach(&wt).unwrap();
    assert!(wt.worktree_path.join("new.txt").exists());

    mgr.cleanup(&wt).unwrap();
    let branches = git(&repo, &["branch", "--list", "af/feature"]);
    assert!(branches.is_empty());
}

#[test]
fn create_refuses_branch_checked_out_in_main_repo() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    isolate_git_env();
    let tmp = tempfile::tempdir().unwrap();
    let repo = init_repo(tmp.path());
    let mgr = WorkspaceManager::new(&DataDir::new(tmp.path().join("data")));

    assert!(mgr.is_branch_checked_out(&repo, "main").unwrap());
    let err = mgr.create(&repo, "main").unwrap_err();
    assert!(matches!(err, WorkspaceError::BranchInUse(_)), "{err}");
}

#[test]
fn conflicting_rebase_is_rolled_back() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    isolate_git_env();
    let tmp = tempfile::tempdir().unwrap();
    let repo = init_repo(tmp.path());
    let mgr = WorkspaceManager::new(&DataDir::new(tmp.path().join("data")));

    let wt = mgr.create(&repo, "af/conflict").unwrap();
    std::fs::write(wt.worktree_path.join("a.txt"), "feature\n").unwrap();
    assert!(mgr.commit_all(&wt, "feature change").unwrap());
    let head_before = git(&wt.worktree_path, &["rev-parse", "HEAD"]);

    std::fs::write(repo.join("a.txt"), "upstream\n").unwrap();
    git(&repo, &["commit", "-am", "upstream change"]);
    git(&repo, &["push", "origin", "main"]);

    let err = mgr.rebase_onto_default(&wt).unwrap_err();
    assert!(matches!(err, WorkspaceError::RebaseFailed { .. }), "{err}");

    assert_eq!(git(&wt.worktree_path, &["rev-parse", "HEAD"]), head_before);
    assert_eq!(
        git(&wt.worktree_path, &["rev-parse", "--abbrev-ref", "HEAD"]),
        "af/conflict"
    );
    assert!(!mgr.is_dirty(&wt).unwrap());

    let cached = mgr.repo_configs().load(&wt.repo_path).unwrap().unwrap();
    assert_eq!(cached.default_branch, "main");
}

#[test]
fn clean_rebase_moves_onto_remote_tip() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    isolate_git_env();
    let tmp = tempfile::tempdir().unwrap();
    let repo = init_repo(tmp.path());
    let mgr = WorkspaceManager::new(&DataDir::new(tmp.path().join("data")));

    let wt = mgr.create(&repo, "af/clean").unwrap();
    std::fs::write(wt.worktree_path.join("b.txt"), "feature\n").unwrap();
    assert!(mgr.commit_all(&wt, "feature file").unwrap());

    std::fs::write(repo.join("c.txt"), "upstream\n").unwrap();
    git(&repo, &["add", "."]);
    git(&repo, &["commit", "-m", "upstream file"]);
    git(&repo, &["push", "origin", "main"]);
    let upstream = git(&repo, &["rev-parse", "HEAD"]);

    mgr.rebase_onto_default(&wt).unwrap();
    assert_eq!(git(&wt.worktree_path, &["rev-parse", "HEAD~1"]), upstream);
    assert!(wt.worktree_path.join("c.txt").exists());
}
