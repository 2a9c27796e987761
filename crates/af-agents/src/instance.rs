use std::path::{Path, PathBuf};
use std::sync::Arc;

use af_core::error::ErrorClass;
use af_core::worktree::{sanitize_branch_name, DiffStats, Worktree};
use af_core::worktree_manager::{WorkspaceError, WorkspaceManager};
use af_session::monitor::OutputSampler;
use af_session::program::ProgramKind;
use af_session::tmux::{SessionError, TmuxRunner, TmuxSession};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::state_machine::{
    decide, InstanceStateMachine, InstanceStatus, LifecycleEvent, PollDecision, StateMachineError,
};
use crate::storage::{InstanceRecord, InstanceStore, StoreError};

/// Longest accepted instance title, in characters.
pub const MAX_TITLE_LEN: usize = 32;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transition(#[from] StateMachineError),

    #[error("title must not be empty")]
    EmptyTitle,

    #[error("title '{0}' is longer than {max} characters", max = MAX_TITLE_LEN)]
    TitleTooLong(String),

    #[error("cannot change the title of a started instance")]
    AlreadyStarted,

    #[error("instance '{0}' has not been started")]
    NotStarted(String),

    #[error("instance '{0}' is paused")]
    Paused(String),

    #[error("instance '{0}' is not paused")]
    NotPaused(String),

    #[error("branch '{0}' is checked out in the main repository; switch to another branch first")]
    BranchCheckedOut(String),
}

impl InstanceError {
    pub fn class(&self) -> ErrorClass {
        match self {
            InstanceError::Workspace(e) => e.class(),
            InstanceError::Session(e) => e.class(),
            InstanceError::Store(StoreError::Io(_) | StoreError::Corrupt { .. } | StoreError::Serde(_)) => {
                ErrorClass::Io
            }
            InstanceError::Store(_)
            | InstanceError::Transition(_)
            | InstanceError::EmptyTitle
            | InstanceError::TitleTooLong(_)
            | InstanceError::AlreadyStarted
            | InstanceError::NotStarted(_)
            | InstanceError::Paused(_)
            | InstanceError::NotPaused(_)
            | InstanceError::BranchCheckedOut(_) => ErrorClass::Precondition,
        }
    }
}

pub type Result<T> = std::result::Result<T, InstanceError>;

// ---------------------------------------------------------------------------
// Context and options
// ---------------------------------------------------------------------------

/// Collaborators shared by every instance in a process.
pub struct InstanceContext {
    pub workspaces: Arc<WorkspaceManager>,
    pub tmux: Arc<dyn TmuxRunner>,
    /// Prepended to titles to form branch names.
    pub branch_prefix: String,
}

#[derive(Debug, Clone)]
pub struct InstanceOptions {
    pub title: String,
    pub repo_path: PathBuf,
    pub program: String,
    pub auto_yes: bool,
}

// ---------------------------------------------------------------------------
// Instance
// ---------------------------------------------------------------------------

/// One supervised agent: a branch, its worktree, and the tmux session the
/// agent program runs in.
pub struct Instance {
    title: String,
    repo_path: PathBuf,
    branch: String,
    program: String,
    kind: ProgramKind,
    auto_yes: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    machine: InstanceStateMachine,
    worktree: Option<Worktree>,
    session: Option<TmuxSession>,
    sampler: OutputSampler,
    diff_stats: DiffStats,
    prompt_pending: bool,
    ctx: Arc<InstanceContext>,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("title", &self.title)
            .field("branch", &self.branch)
            .field("status", &self.status())
            .field("program", &self.program)
            .field("auto_yes", &self.auto_yes)
            .finish()
    }
}

impl Instance {
    /// A new, unstarted instance in `Loading`.
    pub fn new(opts: InstanceOptions, ctx: Arc<InstanceContext>) -> Result<Self> {
        validate_title(&opts.title)?;
        let now = Utc::now();
        let kind = ProgramKind::detect(&opts.program);
        Ok(Self {
            branch: branch_for(&ctx.branch_prefix, &opts.title),
            title: opts.title,
            repo_path: opts.repo_path,
            program: opts.program,
            kind,
            auto_yes: opts.auto_yes,
            created_at: now,
            updated_at: now,
            machine: InstanceStateMachine::new(),
            worktree: None,
            session: None,
            sampler: OutputSampler::new(kind),
            diff_stats: DiffStats::default(),
            prompt_pending: false,
            ctx,
        })
    }

    /// Rebuild from a persisted record, reattaching to whatever survived.
    ///
    /// Paused instances stay paused with no session. Started instances get
    /// their worktree back (reused when still on disk) and their tmux session
    /// restored, or started afresh if it is gone.
    pub fn from_record(record: InstanceRecord, ctx: Arc<InstanceContext>) -> Result<Self> {
        let kind = ProgramKind::detect(&record.program);
        let paused = record.status == InstanceStatus::Paused;
        let mut inst = Self {
            title: record.title,
            repo_path: record.repo_path,
            branch: record.branch,
            program: record.program,
            kind,
            auto_yes: record.auto_yes,
            created_at: record.created_at,
            updated_at: record.updated_at,
            machine: InstanceStateMachine::starting_in(if paused {
                InstanceStatus::Paused
            } else {
                InstanceStatus::Loading
            }),
            worktree: record.worktree,
            session: None,
            sampler: OutputSampler::new(kind),
            diff_stats: record.diff_stats,
            prompt_pending: false,
            ctx,
        };

        if paused {
            debug!(title = %inst.title, "restored paused instance");
            return Ok(inst);
        }
        let Some(wt) = inst.worktree.clone() else {
            debug!(title = %inst.title, "restored unstarted instance");
            return Ok(inst);
        };

        inst.ctx.workspaces.reattach(&wt)?;
        let session = TmuxSession::for_title(&inst.title, Arc::clone(&inst.ctx.tmux));
        if session.exists()? {
            session.restore()?;
            info!(title = %inst.title, session = %session.name(), "session restored");
        } else {
            session.start(&inst.program, &wt.worktree_path)?;
            info!(title = %inst.title, session = %session.name(), "session was gone, started a new one");
        }
        inst.session = Some(session);
        inst.transition(LifecycleEvent::SessionUp)?;
        Ok(inst)
    }

    // -- accessors ------------------------------------------------------------

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn program_kind(&self) -> ProgramKind {
        self.kind
    }

    pub fn status(&self) -> InstanceStatus {
        self.machine.state()
    }

    pub fn auto_yes(&self) -> bool {
        self.auto_yes
    }

    pub fn set_auto_yes(&mut self, auto_yes: bool) {
        self.auto_yes = auto_yes;
    }

    pub fn worktree(&self) -> Option<&Worktree> {
        self.worktree.as_ref()
    }

    pub fn diff_stats(&self) -> &DiffStats {
        &self.diff_stats
    }

    /// A prompt is on screen and nobody is going to accept it automatically.
    pub fn prompt_pending(&self) -> bool {
        self.prompt_pending
    }

    /// The worktree has been created at least once.
    pub fn started(&self) -> bool {
        self.worktree.is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.status() == InstanceStatus::Paused
    }

    pub fn session_name(&self) -> Option<&str> {
        self.session.as_ref().map(TmuxSession::name)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn state_history(&self) -> &[(InstanceStatus, LifecycleEvent, InstanceStatus)] {
        self.machine.history()
    }

    // -- lifecycle ------------------------------------------------------------

    /// Rename an instance that has not been started yet.
    pub fn set_title(&mut self, title: &str) -> Result<()> {
        if self.started() {
            return Err(InstanceError::AlreadyStarted);
        }
        validate_title(title)?;
        self.title = title.to_string();
        self.branch = branch_for(&self.ctx.branch_prefix, title);
        self.touch();
        Ok(())
    }

    /// Create the worktree and start the agent program in a new session.
    ///
    /// If the session fails to start, the fresh worktree and branch are
    /// cleaned up again.
    pub fn start(&mut self) -> Result<()> {
        if self.started() {
            return Err(InstanceError::AlreadyStarted);
        }
        let wt = self.ctx.workspaces.create(&self.repo_path, &self.branch)?;
        let session = TmuxSession::for_title(&self.title, Arc::clone(&self.ctx.tmux));

        if let Err(e) = session.start(&self.program, &wt.worktree_path) {
            warn!(title = %self.title, error = %e, "session failed to start, rolling back workspace");
            if let Err(cleanup_err) = self.ctx.workspaces.cleanup(&wt) {
                warn!(title = %self.title, error = %cleanup_err, "workspace rollback failed");
            }
            return Err(e.into());
        }

        info!(title = %self.title, branch = %self.branch, "instance started");
        self.worktree = Some(wt);
        self.session = Some(session);
        self.transition(LifecycleEvent::SessionUp)?;
        Ok(())
    }

    /// One capture-diff-transition cycle. A no-op unless Running or Ready.
    pub fn poll(&mut self) -> Result<PollDecision> {
        let status = self.status();
        if !matches!(status, InstanceStatus::Running | InstanceStatus::Ready) {
            return Ok(PollDecision::default());
        }
        let Some(session) = self.session.as_ref() else {
            return Ok(PollDecision::default());
        };

        let screen = session.capture()?;
        let sample = self.sampler.observe(&screen);
        let decision = decide(status, &sample, self.auto_yes);

        if decision.inject_confirm {
            session.tap_confirm(self.kind)?;
            self.sampler.mark_confirmed();
            info!(title = %self.title, "auto-accepted prompt");
        }
        if let Some(event) = decision.event {
            self.transition(event)?;
        }
        self.prompt_pending = decision.prompt_pending;
        Ok(decision)
    }

    /// Recompute added/removed line counts. Paused or unstarted instances
    /// report no changes.
    pub fn update_diff_stats(&mut self) -> Result<&DiffStats> {
        let stats = match (&self.worktree, self.is_paused()) {
            (Some(wt), false) => match self.ctx.workspaces.diff_stats(wt) {
                Ok(stats) => stats,
                Err(WorkspaceError::NotFound(_)) => DiffStats::default(),
                Err(e) => return Err(e.into()),
            },
            _ => DiffStats::default(),
        };
        self.diff_stats = stats;
        Ok(&self.diff_stats)
    }

    /// Commit local changes, then tear down the session and worktree.
    /// The branch is kept.
    pub fn pause(&mut self) -> Result<()> {
        if !self.machine.can_transition(LifecycleEvent::Pause) {
            return Err(StateMachineError::InvalidTransition {
                state: self.status(),
                event: LifecycleEvent::Pause,
            }
            .into());
        }
        let wt = self.require_worktree()?.clone();
        self.ensure_not_checked_out()?;

        if wt.exists_on_disk() {
            let message = format!("{} (paused)", commit_message(&self.title));
            self.ctx.workspaces.commit_all(&wt, &message)?;
        }
        if let Some(session) = self.session.as_ref() {
            session.kill()?;
        }
        self.session = None;
        self.ctx.workspaces.remove(&wt)?;

        self.sampler.reset();
        self.diff_stats = DiffStats::default();
        self.prompt_pending = false;
        self.transition(LifecycleEvent::Pause)?;
        info!(title = %self.title, branch = %self.branch, "instance paused");
        Ok(())
    }

    /// Bring a paused instance back on its retained branch.
    pub fn resume(&mut self) -> Result<()> {
        if !self.is_paused() {
            return Err(InstanceError::NotPaused(self.title.clone()));
        }
        let wt = self.require_worktree()?.clone();
        self.ensure_not_checked_out()?;

        self.ctx.workspaces.reattach(&wt)?;
        let session = TmuxSession::for_title(&self.title, Arc::clone(&self.ctx.tmux));
        let started = if session.exists()? {
            session.restore()
        } else {
            session.start(&self.program, &wt.worktree_path)
        };
        if let Err(e) = started {
            warn!(title = %self.title, error = %e, "session failed on resume, removing worktree again");
            if let Err(remove_err) = self.ctx.workspaces.remove(&wt) {
                warn!(title = %self.title, error = %remove_err, "worktree removal failed");
            }
            return Err(e.into());
        }

        self.session = Some(session);
        self.transition(LifecycleEvent::Resume)?;
        self.transition(LifecycleEvent::SessionUp)?;
        info!(title = %self.title, branch = %self.branch, "instance resumed");
        Ok(())
    }

    /// Destroy the session, worktree and branch, then drop the persisted record.
    ///
    /// Refused while the branch is checked out in the main repository.
    pub fn kill(&mut self, store: &InstanceStore) -> Result<()> {
        if let Some(wt) = self.worktree.clone() {
            self.ensure_not_checked_out()?;
            match self.session.as_ref() {
                Some(session) => session.kill()?,
                None => TmuxSession::for_title(&self.title, Arc::clone(&self.ctx.tmux)).kill()?,
            }
            self.session = None;
            self.ctx.workspaces.cleanup(&wt)?;
        }
        store.delete(&self.title)?;
        self.worktree = None;
        info!(title = %self.title, "instance killed");
        Ok(())
    }

    /// Commit everything and publish the branch.
    pub fn push(&self, message: Option<&str>, open: bool) -> Result<()> {
        let wt = self.require_live_worktree()?;
        let message = match message {
            Some(m) if !m.trim().is_empty() => m.to_string(),
            _ => commit_message(&self.title),
        };
        self.ctx.workspaces.push(wt, &message, open)?;
        Ok(())
    }

    /// Rebase the branch onto the remote default branch.
    ///
    /// Blocks for the duration of the fetch and rebase.
    pub fn rebase(&self) -> Result<()> {
        let wt = self.require_live_worktree()?;
        self.ctx.workspaces.rebase_onto_default(wt)?;
        info!(title = %self.title, "rebased onto default branch");
        Ok(())
    }

    /// Type a prompt into the agent and submit it.
    pub fn send_prompt(&self, text: &str) -> Result<()> {
        self.require_session()?.send_text(text)?;
        Ok(())
    }

    /// Hand the terminal to the user. The channel fires on detach.
    pub fn attach(&self) -> Result<flume::Receiver<()>> {
        Ok(self.require_session()?.attach()?)
    }

    /// Attach to a shell session (`<session>-tree`) rooted in the worktree.
    pub fn open_workspace_shell(&self) -> Result<flume::Receiver<()>> {
        let session = self.require_session()?;
        let wt = self.require_live_worktree()?;
        let shell_session = TmuxSession::with_name(
            format!("{}-tree", session.name()),
            Arc::clone(&self.ctx.tmux),
        );
        let shell = std::env::var("SHELL").unwrap_or_else(|_| "sh".into());
        shell_session.start(&shell, &wt.worktree_path)?;
        Ok(shell_session.attach()?)
    }

    /// The current screen, or nothing for a paused or unstarted instance.
    pub fn preview(&self) -> Result<String> {
        match (&self.session, self.is_paused()) {
            (Some(session), false) => Ok(session.capture()?),
            _ => Ok(String::new()),
        }
    }

    pub fn to_record(&self) -> InstanceRecord {
        InstanceRecord {
            title: self.title.clone(),
            repo_path: self.repo_path.clone(),
            branch: self.branch.clone(),
            program: self.program.clone(),
            status: self.status(),
            auto_yes: self.auto_yes,
            created_at: self.created_at,
            updated_at: self.updated_at,
            worktree: self.worktree.clone(),
            diff_stats: DiffStats {
                content: String::new(),
                ..self.diff_stats.clone()
            },
        }
    }

    // -- internals ------------------------------------------------------------

    fn transition(&mut self, event: LifecycleEvent) -> Result<InstanceStatus> {
        let before = self.status();
        let after = self.machine.transition(event)?;
        if before != after {
            self.touch();
        }
        Ok(after)
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    fn require_worktree(&self) -> Result<&Worktree> {
        self.worktree
            .as_ref()
            .ok_or_else(|| InstanceError::NotStarted(self.title.clone()))
    }

    fn require_live_worktree(&self) -> Result<&Worktree> {
        if self.is_paused() {
            return Err(InstanceError::Paused(self.title.clone()));
        }
        self.require_worktree()
    }

    fn require_session(&self) -> Result<&TmuxSession> {
        if self.is_paused() {
            return Err(InstanceError::Paused(self.title.clone()));
        }
        self.session
            .as_ref()
            .ok_or_else(|| InstanceError::NotStarted(self.title.clone()))
    }

    fn ensure_not_checked_out(&self) -> Result<()> {
        if self
            .ctx
            .workspaces
            .is_branch_checked_out(&self.repo_path, &self.branch)?
        {
            return Err(InstanceError::BranchCheckedOut(self.branch.clone()));
        }
        Ok(())
    }
}

fn validate_title(title: &str) -> Result<()> {
    if title.trim().is_empty() {
        return Err(InstanceError::EmptyTitle);
    }
    if title.chars().count() > MAX_TITLE_LEN {
        return Err(InstanceError::TitleTooLong(title.to_string()));
    }
    Ok(())
}

/// Branch name for a title: `sanitize(prefix + title)`.
pub fn branch_for(prefix: &str, title: &str) -> String {
    sanitize_branch_name(&format!("{prefix}{title}"))
}

/// `[agent-farm] update from '<title>' on <RFC 2822 time>`
pub fn commit_message(title: &str) -> String {
    format!(
        "[agent-farm] update from '{}' on {}",
        title,
        Utc::now().to_rfc2822()
    )
}
