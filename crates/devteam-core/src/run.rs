//! Run requests and the mutable per-sprint run state.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::ids::{RunId, TaskId};
use crate::status::RunStatus;

/// Final outcome of one task, as stored in `task_outputs`.
///
/// Results are kept in their string form so a checkpoint round-trip is
/// lossless.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutput {
    /// The executor returned a result.
    Success { result: String },
    /// A best-effort task exhausted its retries; holds the last error.
    SkippedAfterFailure { error: String },
}

impl TaskOutput {
    /// Wrap an executor result. JSON strings are stored as-is, any other
    /// value by its JSON text.
    pub fn from_value(value: serde_json::Value) -> Self {
        let result = match value {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        Self::Success { result }
    }

    /// Returns true for a best-effort skip.
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::SkippedAfterFailure { .. })
    }

    /// The stored result or error text.
    pub fn text(&self) -> &str {
        match self {
            Self::Success { result } => result,
            Self::SkippedAfterFailure { error } => error,
        }
    }
}

/// Which of a role's tools the agent may use.
///
/// On the wire this is either `"all"` or a comma-separated allow-list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ToolSelection {
    #[default]
    All,
    Only(Vec<String>),
}

impl ToolSelection {
    /// Returns true if `tool` passes the selection.
    pub fn allows(&self, tool: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(allowed) => allowed.iter().any(|t| t == tool),
        }
    }

    /// Intersect a role's tool list with this selection, keeping role order.
    pub fn filter(&self, tools: &[String]) -> Vec<String> {
        tools.iter().filter(|t| self.allows(t)).cloned().collect()
    }
}

impl From<String> for ToolSelection {
    fn from(s: String) -> Self {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("all") {
            return Self::All;
        }
        Self::Only(
            trimmed
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }
}

impl From<ToolSelection> for String {
    fn from(selection: ToolSelection) -> Self {
        selection.to_string()
    }
}

impl fmt::Display for ToolSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::Only(tools) => f.write_str(&tools.join(",")),
        }
    }
}

/// Per-run knobs passed through to the task executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessOptions {
    /// Give agents the outputs of the tasks they depend on.
    #[serde(default = "default_true")]
    pub memory: bool,

    /// Allow agents to delegate work to other roles.
    #[serde(default)]
    pub delegation: bool,

    #[serde(default)]
    pub tool_selection: ToolSelection,
}

fn default_true() -> bool {
    true
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            memory: true,
            delegation: false,
            tool_selection: ToolSelection::All,
        }
    }
}

/// Request to start (or resume) a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    pub goal: String,
    pub target_directory: PathBuf,
    #[serde(default)]
    pub process_options: ProcessOptions,
    /// Resume `run_id` from its checkpoint.
    #[serde(default)]
    pub resume: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    /// Start a new run preloaded with another run's checkpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed_from: Option<RunId>,
}

impl RunRequest {
    /// Create a fresh-run request with default options.
    pub fn new(goal: impl Into<String>, target_directory: impl Into<PathBuf>) -> Self {
        Self {
            goal: goal.into(),
            target_directory: target_directory.into(),
            process_options: ProcessOptions::default(),
            resume: false,
            run_id: None,
            seed_from: None,
        }
    }

    /// Check the request is self-consistent before any state is allocated.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.goal.trim().is_empty() {
            return Err(CoreError::InvalidInput("goal must not be empty".into()));
        }
        if self.target_directory.as_os_str().is_empty() {
            return Err(CoreError::InvalidInput(
                "target_directory must not be empty".into(),
            ));
        }
        if self.resume && self.run_id.is_none() {
            return Err(CoreError::InvalidInput("resume requires run_id".into()));
        }
        if self.resume && self.seed_from.is_some() {
            return Err(CoreError::InvalidInput(
                "resume and seed_from are mutually exclusive".into(),
            ));
        }
        for id in self.run_id.iter().chain(self.seed_from.iter()) {
            if !id.is_path_safe() {
                return Err(CoreError::InvalidInput(format!("invalid run id '{id}'")));
            }
        }
        Ok(())
    }
}

/// Why a run ended in `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    CriticalTask,
    Cancelled,
}

/// Details attached to a failed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub reason: FailureReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_name: Option<String>,
    /// Verbatim last error message.
    pub message: String,
}

impl RunFailure {
    pub fn critical_task(
        task_id: TaskId,
        task_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            reason: FailureReason::CriticalTask,
            task_id: Some(task_id),
            task_name: Some(task_name.into()),
            message: message.into(),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            reason: FailureReason::Cancelled,
            task_id: None,
            task_name: None,
            message: message.into(),
        }
    }
}

/// Mutable state of one sprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: RunId,
    pub goal: String,
    pub target_directory: PathBuf,
    pub sprint_number: u32,
    /// Completion order; only ever appended to.
    pub completed_task_ids: Vec<TaskId>,
    pub task_outputs: BTreeMap<TaskId, TaskOutput>,
    pub status: RunStatus,
    pub current_task_id: Option<TaskId>,
    pub feedback: Option<String>,
    pub failure: Option<RunFailure>,
    pub process_options: ProcessOptions,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunState {
    /// Create an empty run in `initializing`.
    pub fn new(
        run_id: RunId,
        goal: impl Into<String>,
        target_directory: impl Into<PathBuf>,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            goal: goal.into(),
            target_directory: target_directory.into(),
            sprint_number: 1,
            completed_task_ids: Vec::new(),
            task_outputs: BTreeMap::new(),
            status: RunStatus::Initializing,
            current_task_id: None,
            feedback: None,
            failure: None,
            process_options: ProcessOptions::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Create the state for a validated request.
    pub fn from_request(run_id: RunId, request: &RunRequest) -> Self {
        let mut state = Self::new(run_id, request.goal.clone(), request.target_directory.clone());
        state.process_options = request.process_options.clone();
        state
    }

    /// State for the next sprint, seeded with caller feedback.
    ///
    /// This is a new run: completed tasks and outputs start empty.
    pub fn next_sprint(&self, run_id: RunId, feedback: impl Into<String>) -> Self {
        let mut next = Self::new(run_id, self.goal.clone(), self.target_directory.clone());
        next.sprint_number = self.sprint_number + 1;
        next.feedback = Some(feedback.into());
        next.process_options = self.process_options.clone();
        next
    }

    pub fn is_completed(&self, task_id: &TaskId) -> bool {
        self.task_outputs.contains_key(task_id)
    }

    /// Completed (and skipped) task ids as a set, for readiness checks.
    pub fn completed_set(&self) -> HashSet<TaskId> {
        self.completed_task_ids.iter().cloned().collect()
    }

    /// Append a finished task. A task already recorded is left untouched.
    pub fn record_output(&mut self, task_id: TaskId, output: TaskOutput) {
        if self.is_completed(&task_id) {
            return;
        }
        self.completed_task_ids.push(task_id.clone());
        self.task_outputs.insert(task_id, output);
        self.current_task_id = None;
        self.touch();
    }

    /// Ids whose output is a best-effort skip, in completion order.
    pub fn skipped_task_ids(&self) -> Vec<TaskId> {
        self.completed_task_ids
            .iter()
            .filter(|id| self.task_outputs.get(*id).is_some_and(TaskOutput::is_skipped))
            .cloned()
            .collect()
    }

    /// Share of `total_tasks` done, 0-100.
    pub fn progress_percent(&self, total_tasks: usize) -> u8 {
        if self.status == RunStatus::Completed {
            return 100;
        }
        if total_tasks == 0 {
            return 0;
        }
        let done = self.completed_task_ids.len().min(total_tasks);
        ((done * 100) / total_tasks) as u8
    }

    /// Parameters for rendering task description templates.
    pub fn params(&self) -> HashMap<String, String> {
        let mut params = HashMap::new();
        params.insert("goal".to_string(), self.goal.clone());
        params.insert(
            "target_directory".to_string(),
            self.target_directory.display().to_string(),
        );
        params.insert("sprint_number".to_string(), self.sprint_number.to_string());
        params.insert(
            "feedback".to_string(),
            self.feedback.clone().unwrap_or_else(|| "none".to_string()),
        );
        params
    }

    pub fn mark_running(&mut self) {
        self.status = RunStatus::Running;
        self.touch();
    }

    pub fn mark_completed(&mut self) {
        self.status = RunStatus::Completed;
        self.current_task_id = None;
        self.touch();
    }

    pub fn mark_failed(&mut self, failure: RunFailure) {
        self.status = RunStatus::Failed;
        self.current_task_id = None;
        self.failure = Some(failure);
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Pull-based status snapshot.
    pub fn view(&self, total_tasks: usize) -> RunStatusView {
        let result = (self.status == RunStatus::Completed).then(|| {
            serde_json::to_value(&self.task_outputs).unwrap_or(serde_json::Value::Null)
        });
        RunStatusView {
            run_id: self.run_id.clone(),
            status: self.status,
            goal: self.goal.clone(),
            sprint_number: self.sprint_number,
            progress_percent: self.progress_percent(total_tasks),
            current_task_id: self.current_task_id.clone(),
            completed_task_ids: self.completed_task_ids.clone(),
            skipped_task_ids: self.skipped_task_ids(),
            total_tasks,
            result,
            error: self.failure.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Response body of the status query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatusView {
    pub run_id: RunId,
    pub status: RunStatus,
    pub goal: String,
    pub sprint_number: u32,
    pub progress_percent: u8,
    pub current_task_id: Option<TaskId>,
    pub completed_task_ids: Vec<TaskId>,
    #[serde(default)]
    pub skipped_task_ids: Vec<TaskId>,
    pub total_tasks: usize,
    /// Aggregated `task_outputs`, present once the run has completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Response to a run request or a feedback submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunAccepted {
    pub run_id: RunId,
    pub status: RunStatus,
}

/// Which task to replay: by id, or by position in the resolved order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_index: Option<usize>,
}

impl ReplayRequest {
    pub fn task(task_id: impl Into<TaskId>) -> Self {
        Self {
            task_id: Some(task_id.into()),
            task_index: None,
        }
    }

    pub fn index(task_index: usize) -> Self {
        Self {
            task_id: None,
            task_index: Some(task_index),
        }
    }

    /// A bare number selects by index, anything else by task id.
    pub fn parse(selector: &str) -> Self {
        let selector = selector.trim();
        match selector.parse::<usize>() {
            Ok(index) => Self::index(index),
            Err(_) => Self::task(selector),
        }
    }

    /// Exactly one of `task_id` and `task_index` must be set.
    pub fn validate(&self) -> Result<(), CoreError> {
        match (&self.task_id, self.task_index) {
            (Some(_), Some(_)) => Err(CoreError::InvalidInput(
                "task_id and task_index are mutually exclusive".into(),
            )),
            (None, None) => Err(CoreError::InvalidInput(
                "replay needs a task_id or a task_index".into(),
            )),
            _ => Ok(()),
        }
    }
}

/// Outcome of re-executing one task outside the normal run flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayReport {
    pub run_id: RunId,
    pub task_id: TaskId,
    pub task_name: String,
    pub role: String,
    /// Rendered description the agent was given.
    pub description: String,
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Last error when every attempt failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
    pub timestamp: DateTime<Utc>,
    /// Where the report was written, if it was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_to: Option<PathBuf>,
}
