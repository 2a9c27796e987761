use std::fmt;

use af_session::monitor::Sample;
use serde::{Deserialize, Serialize};

/// Transitions kept in the history ring.
const MAX_HISTORY: usize = 64;

// ---------------------------------------------------------------------------
// InstanceStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Created or resuming; the session is not up yet.
    Loading,
    /// The screen changed since the previous poll.
    Running,
    /// The screen is stable and no prompt is waiting.
    Ready,
    /// Session and worktree torn down; the branch is kept.
    Paused,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            InstanceStatus::Loading => "Loading",
            InstanceStatus::Running => "Running",
            InstanceStatus::Ready => "Ready",
            InstanceStatus::Paused => "Paused",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// LifecycleEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// The terminal session was started or restored.
    SessionUp,
    /// A poll saw new output, or a prompt was auto-accepted.
    Output,
    /// A poll saw unchanged output and no prompt.
    Settled,
    Pause,
    Resume,
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LifecycleEvent::SessionUp => "SessionUp",
            LifecycleEvent::Output => "Output",
            LifecycleEvent::Settled => "Settled",
            LifecycleEvent::Pause => "Pause",
            LifecycleEvent::Resume => "Resume",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StateMachineError {
    #[error("invalid transition: cannot apply {event} in state {state}")]
    InvalidTransition {
        state: InstanceStatus,
        event: LifecycleEvent,
    },
}

// ---------------------------------------------------------------------------
// InstanceStateMachine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct InstanceStateMachine {
    current: InstanceStatus,
    history: Vec<(InstanceStatus, LifecycleEvent, InstanceStatus)>,
}

impl InstanceStateMachine {
    pub fn new() -> Self {
        Self::starting_in(InstanceStatus::Loading)
    }

    /// A machine rebuilt from a persisted status.
    pub fn starting_in(status: InstanceStatus) -> Self {
        Self {
            current: status,
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> InstanceStatus {
        self.current
    }

    /// Recent transitions that changed the state, oldest first.
    pub fn history(&self) -> &[(InstanceStatus, LifecycleEvent, InstanceStatus)] {
        &self.history
    }

    /// Valid transitions:
    /// - Loading          + SessionUp -> Running
    /// - Running | Ready  + Output    -> Running
    /// - Running | Ready  + Settled   -> Ready
    /// - Running | Ready  + Pause     -> Paused
    /// - Paused           + Resume    -> Loading
    pub fn transition(
        &mut self,
        event: LifecycleEvent,
    ) -> Result<InstanceStatus, StateMachineError> {
        use InstanceStatus::*;
        use LifecycleEvent::*;

        let next = match (self.current, event) {
            (Loading, SessionUp) => Running,
            (Running | Ready, Output) => Running,
            (Running | Ready, Settled) => Ready,
            (Running | Ready, Pause) => Paused,
            (Paused, Resume) => Loading,
            _ => {
                return Err(StateMachineError::InvalidTransition {
                    state: self.current,
                    event,
                });
            }
        };

        let from = self.current;
        self.current = next;
        if from != next {
            if self.history.len() == MAX_HISTORY {
                self.history.remove(0);
            }
            self.history.push((from, event, next));
            tracing::debug!(from = %from, event = %event, to = %next, "instance state transition");
        }
        Ok(next)
    }

    pub fn can_transition(&self, event: LifecycleEvent) -> bool {
        use InstanceStatus::*;
        use LifecycleEvent::*;
        matches!(
            (self.current, event),
            (Loading, SessionUp)
                | (Running | Ready, Output | Settled | Pause)
                | (Paused, Resume)
        )
    }
}

impl Default for InstanceStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Poll decision
// ---------------------------------------------------------------------------

/// Outcome of one capture-diff cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PollDecision {
    /// Event to apply, if any.
    pub event: Option<LifecycleEvent>,
    /// Send the program's confirm keys.
    pub inject_confirm: bool,
    /// A prompt is waiting for a human.
    pub prompt_pending: bool,
}

/// The status heuristic, as a pure function of one screen sample.
///
/// - changed output means Running
/// - an unconfirmed prompt with auto-accept on is confirmed and counts as
///   output, so the instance stays Running instead of settling
/// - unchanged output with no prompt settles to Ready
/// - unchanged output with a prompt keeps the current status
///
/// Only Running and Ready instances are polled; anything else yields no
/// decision.
pub fn decide(status: InstanceStatus, sample: &Sample, auto_yes: bool) -> PollDecision {
    if !matches!(status, InstanceStatus::Running | InstanceStatus::Ready) {
        return PollDecision::default();
    }

    let inject_confirm = auto_yes && sample.fresh_prompt;
    let event = if sample.changed || inject_confirm {
        Some(LifecycleEvent::Output)
    } else if sample.prompt {
        None
    } else {
        Some(LifecycleEvent::Settled)
    };

    PollDecision {
        event,
        inject_confirm,
        prompt_pending: sample.prompt && !auto_yes,
    }
}
