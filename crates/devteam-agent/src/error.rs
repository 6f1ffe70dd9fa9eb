//! Error types for task executors.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while an agent executes a task.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Claude CLI executable not found.
    #[error("Claude CLI not found at '{0}'. Ensure Claude Code is installed.")]
    ClaudeNotFound(String),

    /// The directory the agent should work in does not exist.
    #[error("Working directory '{}' does not exist", .0.display())]
    WorkingDirMissing(PathBuf),

    /// Failed to spawn the agent process.
    #[error("Failed to spawn agent process: {0}")]
    Spawn(#[from] std::io::Error),

    /// Agent process exited unsuccessfully.
    #[error("Agent process exited with error: {0}")]
    Process(String),

    /// The agent finished but reported an error result.
    #[error("Agent reported an error: {0}")]
    Reported(String),

    /// Output could not be understood.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The task took longer than the configured limit.
    #[error("Agent timed out after {0:?}")]
    Timeout(Duration),

    /// The executor refuses the task outright; retrying cannot help.
    #[error("Task rejected: {0}")]
    Rejected(String),
}

impl AgentError {
    /// Returns true if another attempt may succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            Self::ClaudeNotFound(_) | Self::WorkingDirMissing(_) | Self::Rejected(_)
        )
    }
}
