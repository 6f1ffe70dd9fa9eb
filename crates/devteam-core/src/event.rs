//! Progress events fanned out to live listeners.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{RunId, TaskId};
use crate::status::RunStatus;

/// One progress update for a run.
///
/// Events are not persisted; a listener that missed some should ask for the
/// current status instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub run_id: RunId,
    pub status: RunStatus,
    pub message: String,
    pub progress_percent: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    /// 1-based attempt number for per-attempt events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
}

impl ProgressEvent {
    pub fn new(
        run_id: RunId,
        status: RunStatus,
        message: impl Into<String>,
        progress_percent: u8,
    ) -> Self {
        Self {
            run_id,
            status,
            message: message.into(),
            progress_percent: progress_percent.min(100),
            result: None,
            error: None,
            timestamp: Utc::now(),
            task_id: None,
            attempt: None,
        }
    }

    pub fn with_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Returns true if this is the last event a run will publish.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
