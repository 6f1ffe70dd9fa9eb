//! Run lifecycle status.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a Run.
///
/// `Initializing -> Running -> {Completed | Failed}`. Cancellation ends in
/// `Failed` with a cancelled reason recorded on the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Run state allocated or resumed; task order being resolved.
    #[default]
    Initializing,
    /// Tasks are being executed.
    Running,
    /// Every task completed or was skipped after a best-effort failure.
    Completed,
    /// A critical task failed, or the run was cancelled.
    Failed,
}

impl RunStatus {
    /// Returns true if the run is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns true if the run is still active (not terminal).
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Lowercase name used on the wire and in metrics labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!RunStatus::Initializing.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
    }

    #[test]
    fn test_wire_format() {
        let json = serde_json::to_string(&RunStatus::Initializing).unwrap();
        assert_eq!(json, "\"initializing\"");
        assert_eq!(RunStatus::Completed.to_string(), "completed");
    }
}
