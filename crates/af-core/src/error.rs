use std::fmt;

use serde::{Deserialize, Serialize};

/// Coarse classification shared by the workspace and session error types.
///
/// Callers branch on the class rather than on individual variants: an
/// `ExternalTool` failure is retryable, a `Precondition` was rejected before
/// any tool ran, `ResourceAbsence` invites a creation fallback, and
/// `PartialFailure` means a multi-step mutation was interrupted and a rollback
/// was attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    ExternalTool,
    Precondition,
    ResourceAbsence,
    PartialFailure,
    Io,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorClass::ExternalTool => "external tool failure",
            ErrorClass::Precondition => "precondition violation",
            ErrorClass::ResourceAbsence => "resource absent",
            ErrorClass::PartialFailure => "partial failure",
            ErrorClass::Io => "io",
        };
        write!(f, "{label}")
    }
}
