use std::path::PathBuf;
use std::sync::Arc;

use af_agents::instance::{Instance, InstanceContext, InstanceError, InstanceOptions};
use af_agents::state_machine::InstanceStatus;
use af_agents::storage::InstanceStore;
use af_core::error::ErrorClass;
use af_core::paths::DataDir;
use af_core::repo_lock::RepoLocks;
use af_core::runner::ToolOutput;
use af_core::testing::{FakeGh, FakeGit};
use af_core::worktree_manager::{WorkspaceError, WorkspaceManager};
use af_session::testing::FakeTmux;

const CLAUDE_PROMPT: &str =
    "Do you want to make this edit?\n❯ 1. Yes\n  2. No, and tell Claude what to do differently (esc)";

struct Harness {
    _tmp: tempfile::TempDir,
    repo: PathBuf,
    git: Arc<FakeGit>,
    gh: Arc<FakeGh>,
    tmux: Arc<FakeTmux>,
    ctx: Arc<InstanceContext>,
    store: InstanceStore,
}

fn harness() -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let data = DataDir::new(tmp.path().join("data"));
    let repo = tmp.path().join("repo");
    std::fs::create_dir_all(&repo).unwrap();

    let git = Arc::new(FakeGit::new());
    git.respond(
        &["rev-parse", "--show-toplevel"],
        ToolOutput::ok(repo.display().to_string()),
    );
    git.respond(&["rev-parse", "HEAD"], ToolOutput::ok("c0ffee\n"));
    git.respond(&["show-ref"], ToolOutput::failed(""));
    git.respond(&["branch", "--show-current"], ToolOutput::ok("main\n"));
    let gh = Arc::new(FakeGh::new());
    let tmux = Arc::new(FakeTmux::new());

    let workspaces = WorkspaceManager::with_runners(&data, git.clone(), gh.clone())
        .with_locks(Arc::new(RepoLocks::new()));
    let ctx = Arc::new(InstanceContext {
        workspaces: Arc::new(workspaces),
        tmux: tmux.clone(),
        branch_prefix: "alice/".into(),
    });
    let store = InstanceStore::new(data.state_file());

    Harness {
        _tmp: tmp,
        repo,
        git,
        gh,
        tmux,
        ctx,
        store,
    }
}

impl Harness {
    fn instance(&self, title: &str, auto_yes: bool) -> Instance {
        Instance::new(
            InstanceOptions {
                title: title.into(),
                repo_path: self.repo.clone(),
                program: "claude".into(),
                auto_yes,
            },
            Arc::clone(&self.ctx),
        )
        .unwrap()
    }

    fn started(&self, title: &str, auto_yes: bool) -> Instance {
        let mut inst = self.instance(title, auto_yes);
        inst.start().unwrap();
        self.store.upsert(inst.to_record()).unwrap();
        inst
    }

    fn last_git(&self, prefix: &[&str]) -> Option<Vec<String>> {
        self.git
            .calls()
            .into_iter()
            .filter(|argv| {
                argv.len() >= prefix.len() && argv.iter().zip(prefix).all(|(a, p)| a == p)
            })
            .last()
    }
}

// ---------------------------------------------------------------------------
// Creation and polling
// ---------------------------------------------------------------------------

#[test]
fn new_instance_runs_then_settles_to_ready() {
    let h = harness();
    let mut inst = h.instance("feat-x", false);
    assert_eq!(inst.status(), InstanceStatus::Loading);

    inst.start().unwrap();
    assert_eq!(inst.branch(), "alice/feat-x");
    assert_eq!(inst.status(), InstanceStatus::Running);
    assert!(h.tmux.has("af_feat-x"));
    assert!(inst.worktree().unwrap().exists_on_disk());

    h.tmux.set_screen("af_feat-x", "Writing src/main.rs ...");
    inst.poll().unwrap();
    assert_eq!(inst.status(), InstanceStatus::Running);

    inst.poll().unwrap();
    assert_eq!(inst.status(), InstanceStatus::Ready);

    inst.poll().unwrap();
    assert_eq!(inst.status(), InstanceStatus::Ready);
    assert!(h.tmux.keys_sent("af_feat-x").is_empty());

    h.tmux.set_screen("af_feat-x", "Writing src/lib.rs ...");
    inst.poll().unwrap();
    assert_eq!(inst.status(), InstanceStatus::Running);
}

#[test]
fn auto_yes_confirms_each_prompt_once() {
    let h = harness();
    let mut inst = h.started("auto", true);
    h.tmux.set_screen("af_auto", CLAUDE_PROMPT);

    let first = inst.poll().unwrap();
    assert!(first.inject_confirm);
    assert_eq!(inst.status(), InstanceStatus::Running);
    assert_eq!(h.tmux.keys_sent("af_auto"), vec![vec!["Enter".to_string()]]);

    let second = inst.poll().unwrap();
    assert!(!second.inject_confirm);
    assert_eq!(inst.status(), InstanceStatus::Running);
    assert_eq!(h.tmux.keys_sent("af_auto").len(), 1);
    assert!(!inst.prompt_pending());
}

#[test]
fn prompt_without_auto_yes_waits_for_a_human() {
    let h = harness();
    let mut inst = h.started("manual", false);
    h.tmux.set_screen("af_manual", CLAUDE_PROMPT);

    inst.poll().unwrap();
    inst.poll().unwrap();
    assert_eq!(inst.status(), InstanceStatus::Running);
    assert!(inst.prompt_pending());
    assert!(h.tmux.keys_sent("af_manual").is_empty());
}

#[test]
fn title_is_fixed_once_started() {
    let h = harness();
    let mut inst = h.instance("draft", false);
    inst.set_title("renamed").unwrap();
    assert_eq!(inst.branch(), "alice/renamed");

    inst.start().unwrap();
    assert!(matches!(inst.set_title("again"), Err(InstanceError::AlreadyStarted)));
    assert!(matches!(
        inst.set_title(""),
        Err(InstanceError::AlreadyStarted)
    ));
}

#[test]
fn failed_session_start_rolls_back_workspace() {
    let h = harness();
    h.tmux.set_missing(true);
    let mut inst = h.instance("nope", false);

    let err = inst.start().unwrap_err();
    assert_eq!(err.class(), ErrorClass::ResourceAbsence);
    assert!(!inst.started());
    assert!(h.git.find(&["worktree", "remove", "-f"]).is_some());
}

#[test]
fn diff_stats_refresh() {
    let h = harness();
    let mut inst = h.started("diffs", false);
    h.git.respond(
        &["--no-pager", "diff"],
        ToolOutput::ok("--- a/f\n+++ b/f\n+new line\n-old line\n+another\n"),
    );
    let stats = inst.update_diff_stats().unwrap();
    assert_eq!((stats.added, stats.removed), (2, 1));
}

// ---------------------------------------------------------------------------
// Pause / resume
// ---------------------------------------------------------------------------

#[test]
fn pause_commits_and_tears_down_but_keeps_branch() {
    let h = harness();
    let mut inst = h.started("feat-x", false);
    let wt = inst.worktree().unwrap().clone();
    h.git.respond(&["status", "--porcelain"], ToolOutput::ok(" M src/lib.rs\n"));

    inst.pause().unwrap();

    assert_eq!(inst.status(), InstanceStatus::Paused);
    assert!(!h.tmux.has("af_feat-x"));
    assert!(!wt.exists_on_disk());
    let commit = h.git.find(&["commit"]).unwrap();
    assert!(commit[2].starts_with("[agent-farm] update from 'feat-x' on "));
    assert!(commit[2].ends_with("(paused)"));
    assert!(h.git.find(&["branch", "-D"]).is_none());
    assert_eq!(inst.preview().unwrap(), "");
}

#[test]
fn pause_then_resume_keeps_branch_and_commits() {
    let h = harness();
    let mut inst = h.started("feat-x", false);
    h.git.respond(&["status", "--porcelain"], ToolOutput::ok("?? notes.md\n"));
    inst.pause().unwrap();

    h.git.respond(&["status", "--porcelain"], ToolOutput::ok(""));
    h.git.respond(&["show-ref"], ToolOutput::ok(""));
    inst.resume().unwrap();

    assert_eq!(inst.status(), InstanceStatus::Running);
    assert_eq!(inst.branch(), "alice/feat-x");
    assert!(h.tmux.has("af_feat-x"));
    assert!(inst.worktree().unwrap().exists_on_disk());

    let add = h.last_git(&["worktree", "add"]).unwrap();
    assert_eq!(add.len(), 4, "reattached without creating a branch: {add:?}");
    assert_eq!(add[3], "alice/feat-x");
    assert_eq!(h.git.count(&["commit"]), 1);
}

#[test]
fn resume_refused_while_branch_checked_out() {
    let h = harness();
    let mut inst = h.started("feat-x", false);
    inst.pause().unwrap();

    h.git.respond(&["branch", "--show-current"], ToolOutput::ok("alice/feat-x\n"));
    let err = inst.resume().unwrap_err();
    assert!(matches!(err, InstanceError::BranchCheckedOut(_)));
    assert_eq!(inst.status(), InstanceStatus::Paused);
}

#[test]
fn failed_session_teardown_keeps_the_instance_reachable() {
    let h = harness();
    let mut inst = h.started("feat-x", false);
    let wt = inst.worktree().unwrap().clone();
    h.tmux.set_screen("af_feat-x", "still working");
    h.tmux.fail_command("kill-session");

    assert!(inst.pause().is_err());
    assert_eq!(inst.status(), InstanceStatus::Running);
    assert_eq!(inst.session_name(), Some("af_feat-x"));
    assert!(wt.exists_on_disk());
    assert_eq!(inst.preview().unwrap(), "still working");

    assert!(inst.kill(&h.store).is_err());
    assert_eq!(inst.session_name(), Some("af_feat-x"));
    assert_eq!(h.store.load().unwrap().len(), 1);

    h.tmux.heal_command("kill-session");
    inst.pause().unwrap();
    assert_eq!(inst.status(), InstanceStatus::Paused);
    assert!(!h.tmux.has("af_feat-x"));
    assert!(inst.session_name().is_none());
}

#[test]
fn pausing_twice_is_rejected() {
    let h = harness();
    let mut inst = h.started("feat-x", false);
    inst.pause().unwrap();
    let err = inst.pause().unwrap_err();
    assert_eq!(err.class(), ErrorClass::Precondition);
    assert!(matches!(inst.resume(), Ok(())));
    assert!(matches!(inst.resume(), Err(InstanceError::NotPaused(_))));
}

// ---------------------------------------------------------------------------
// Kill
// ---------------------------------------------------------------------------

#[test]
fn kill_refused_while_branch_checked_out() {
    let h = harness();
    let mut inst = h.started("feat-x", false);
    h.git.respond(&["branch", "--show-current"], ToolOutput::ok("alice/feat-x\n"));
    h.git.clear_calls();

    let err = inst.kill(&h.store).unwrap_err();
    assert!(matches!(err, InstanceError::BranchCheckedOut(_)));
    assert_eq!(err.class(), ErrorClass::Precondition);
    assert!(h.tmux.has("af_feat-x"));
    assert_eq!(h.store.load().unwrap().len(), 1);
    assert!(h.git.find(&["worktree", "remove"]).is_none());
    assert!(h.git.find(&["branch", "-D"]).is_none());
}

#[test]
fn kill_removes_session_workspace_branch_and_record() {
    let h = harness();
    let mut inst = h.started("feat-x", false);
    let wt = inst.worktree().unwrap().clone();
    h.git.respond(&["show-ref"], ToolOutput::ok(""));

    inst.kill(&h.store).unwrap();

    assert!(!h.tmux.has("af_feat-x"));
    assert!(!wt.exists_on_disk());
    assert_eq!(
        h.git.find(&["branch", "-D"]).unwrap(),
        vec!["branch", "-D", "alice/feat-x"]
    );
    assert!(h.store.load().unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Publishing
// ---------------------------------------------------------------------------

#[test]
fn push_commits_then_repeat_push_only_syncs() {
    let h = harness();
    let inst = h.started("feat-x", false);

    h.git.respond(&["status", "--porcelain"], ToolOutput::ok(" M a.rs\n"));
    inst.push(Some("msg"), false).unwrap();
    assert_eq!(
        h.git.find(&["commit"]).unwrap(),
        vec!["commit", "-m", "msg", "--no-verify"]
    );
    assert_eq!(h.gh.count(&["repo", "sync", "-b", "alice/feat-x"]), 1);

    h.git.respond(&["status", "--porcelain"], ToolOutput::ok(""));
    inst.push(Some("msg"), false).unwrap();
    assert_eq!(h.git.count(&["commit"]), 1);
    assert_eq!(h.gh.count(&["repo", "sync"]), 2);
}

#[test]
fn push_without_message_uses_default() {
    let h = harness();
    let inst = h.started("feat-x", false);
    h.git.respond(&["status", "--porcelain"], ToolOutput::ok(" M a.rs\n"));
    inst.push(None, false).unwrap();
    let commit = h.git.find(&["commit"]).unwrap();
    assert!(commit[2].starts_with("[agent-farm] update from 'feat-x' on "));
}

#[test]
fn rebase_of_dirty_instance_is_a_precondition_violation() {
    let h = harness();
    let inst = h.started("feat-x", false);
    h.git.respond(&["status", "--porcelain"], ToolOutput::ok(" M a.rs\n"));

    let err = inst.rebase().unwrap_err();
    assert!(matches!(err, InstanceError::Workspace(WorkspaceError::Dirty)));
    assert_eq!(err.class(), ErrorClass::Precondition);
    assert_eq!(err.to_string().matches("commit or stash").count(), 1);
    assert!(h.git.find(&["fetch"]).is_none());
    assert!(h.git.find(&["rebase"]).is_none());
}

#[test]
fn paused_instance_cannot_push_or_prompt() {
    let h = harness();
    let mut inst = h.started("feat-x", false);
    inst.pause().unwrap();
    assert!(matches!(inst.push(None, false), Err(InstanceError::Paused(_))));
    assert!(matches!(inst.send_prompt("hi"), Err(InstanceError::Paused(_))));
}

#[test]
fn send_prompt_types_into_session() {
    let h = harness();
    let inst = h.started("feat-x", false);
    inst.send_prompt("add tests").unwrap();
    assert_eq!(
        h.tmux.keys_sent("af_feat-x"),
        vec![vec!["add tests".to_string()], vec!["Enter".to_string()]]
    );
}

#[test]
fn workspace_shell_uses_tree_session() {
    let h = harness();
    let inst = h.started("feat-x", false);
    let rx = inst.open_workspace_shell().unwrap();
    rx.recv_timeout(std::time::Duration::from_secs(2)).unwrap();
    assert!(h.tmux.has("af_feat-x-tree"));
    assert_eq!(h.tmux.attached(), vec!["af_feat-x-tree".to_string()]);
}

// ---------------------------------------------------------------------------
// Restore after restart
// ---------------------------------------------------------------------------

#[test]
fn restart_keeps_paused_paused_and_restores_running_session() {
    let h = harness();
    let mut paused = h.started("sleepy", false);
    paused.pause().unwrap();
    let running = h.started("busy", false);
    h.store
        .save(&[paused.to_record(), running.to_record()])
        .unwrap();
    drop(paused);
    drop(running);
    h.tmux.clear_calls();

    let mut restored: Vec<Instance> = h
        .store
        .load()
        .unwrap()
        .into_iter()
        .map(|r| Instance::from_record(r, Arc::clone(&h.ctx)).unwrap())
        .collect();

    assert_eq!(restored[0].status(), InstanceStatus::Paused);
    assert!(restored[0].session_name().is_none());
    assert!(!h.tmux.has("af_sleepy"));

    assert_eq!(restored[1].status(), InstanceStatus::Running);
    assert_eq!(restored[1].session_name(), Some("af_busy"));
    assert_eq!(h.tmux.count(&["new-session"]), 0, "session restored, not recreated");

    h.tmux.set_screen("af_busy", "still going");
    restored[1].poll().unwrap();
    restored[1].poll().unwrap();
    assert_eq!(restored[1].status(), InstanceStatus::Ready);
}

#[test]
fn restart_recreates_a_vanished_session() {
    let h = harness();
    let inst = h.started("ghost", false);
    let record = inst.to_record();
    drop(inst);
    h.tmux.clear_calls();
    // The tmux server went away with the session.
    let session_gone = Arc::new(FakeTmux::new());
    let ctx = Arc::new(InstanceContext {
        workspaces: Arc::clone(&h.ctx.workspaces),
        tmux: session_gone.clone(),
        branch_prefix: "alice/".into(),
    });

    let restored = Instance::from_record(record, ctx).unwrap();
    assert_eq!(restored.status(), InstanceStatus::Running);
    assert_eq!(session_gone.count(&["new-session"]), 1);
}
