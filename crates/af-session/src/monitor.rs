use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::program::ProgramKind;

/// What one captured screen says about the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Sample {
    /// Content differs from the previous observation. The first observation
    /// always counts as changed.
    pub changed: bool,
    /// An approval prompt is visible.
    pub prompt: bool,
    /// A prompt is visible and this exact screen has not been confirmed yet.
    pub fresh_prompt: bool,
}

/// Polling sampler over opaque screen snapshots.
///
/// Keeps only content hashes: the last one seen, and the one on which a
/// confirmation was last sent, so a prompt that stays on screen unchanged is
/// confirmed once rather than on every poll.
#[derive(Debug, Clone)]
pub struct OutputSampler {
    kind: ProgramKind,
    last_hash: Option<u64>,
    confirmed_hash: Option<u64>,
}

impl OutputSampler {
    pub fn new(kind: ProgramKind) -> Self {
        Self {
            kind,
            last_hash: None,
            confirmed_hash: None,
        }
    }

    pub fn kind(&self) -> ProgramKind {
        self.kind
    }

    pub fn observe(&mut self, screen: &str) -> Sample {
        let hash = hash_screen(screen);
        let changed = self.last_hash != Some(hash);
        self.last_hash = Some(hash);

        let prompt = self.kind.has_prompt(screen);
        Sample {
            changed,
            prompt,
            fresh_prompt: prompt && self.confirmed_hash != Some(hash),
        }
    }

    /// Record that the most recently observed screen was confirmed.
    pub fn mark_confirmed(&mut self) {
        self.confirmed_hash = self.last_hash;
    }

    /// Forget history, e.g. after the session was restarted.
    pub fn reset(&mut self) {
        self.last_hash = None;
        self.confirmed_hash = None;
    }
}

fn hash_screen(screen: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    screen.hash(&mut hasher);
    hasher.finish()
}
