use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Agent program families with known confirmation prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramKind {
    Claude,
    Aider,
    Gemini,
    /// Anything else. Never reports a prompt.
    Other,
}

impl ProgramKind {
    /// Classify a command line by the file name of its executable.
    pub fn detect(program: &str) -> Self {
        let exe = program.split_whitespace().next().unwrap_or_default();
        let name = Path::new(exe)
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if name.contains("claude") {
            ProgramKind::Claude
        } else if name.contains("aider") {
            ProgramKind::Aider
        } else if name.contains("gemini") {
            ProgramKind::Gemini
        } else {
            ProgramKind::Other
        }
    }

    /// Text that appears on screen while the program waits for approval.
    pub fn prompt_marker(&self) -> Option<&'static str> {
        match self {
            ProgramKind::Claude => Some("No, and tell Claude what to do differently"),
            ProgramKind::Aider => Some("(Y)es/(N)o/(D)on't ask again"),
            ProgramKind::Gemini => Some("Yes, allow once"),
            ProgramKind::Other => None,
        }
    }

    /// tmux key names that accept the prompt.
    pub fn confirm_keys(&self) -> &'static [&'static str] {
        match self {
            ProgramKind::Aider => &["D", "Enter"],
            _ => &["Enter"],
        }
    }

    pub fn has_prompt(&self, screen: &str) -> bool {
        self.prompt_marker()
            .is_some_and(|marker| screen.contains(marker))
    }
}

impl fmt::Display for ProgramKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProgramKind::Claude => "claude",
            ProgramKind::Aider => "aider",
            ProgramKind::Gemini => "gemini",
            ProgramKind::Other => "other",
        };
        write!(f, "{s}")
    }
}
