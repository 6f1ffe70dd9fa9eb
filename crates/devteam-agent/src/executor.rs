//! The seam between the orchestration core and whatever runs an agent.

use std::path::PathBuf;

use async_trait::async_trait;
use devteam_core::{Role, RunId, TaskId};
use serde_json::Value;

use crate::error::AgentError;

/// Everything an executor knows about the task beyond its description.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub run_id: RunId,
    pub task_id: TaskId,
    pub task_name: String,
    /// Working directory the agent operates in.
    pub target_directory: PathBuf,
    pub sprint_number: u32,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Outputs of the task's dependencies, in dependency order. Empty when
    /// the run has memory disabled.
    pub dependency_outputs: Vec<(TaskId, String)>,
    /// Role tools left after the run's tool selection.
    pub tools: Vec<String>,
    pub delegation: bool,
}

impl AgentContext {
    pub fn new(run_id: RunId, task_id: TaskId, target_directory: impl Into<PathBuf>) -> Self {
        Self {
            run_id,
            task_name: task_id.as_str().to_string(),
            task_id,
            target_directory: target_directory.into(),
            sprint_number: 1,
            attempt: 1,
            dependency_outputs: Vec::new(),
            tools: Vec::new(),
            delegation: false,
        }
    }

    /// The rendered description followed by dependency outputs.
    pub fn prompt(&self, description: &str) -> String {
        let mut prompt = description.trim_end().to_string();
        if !self.dependency_outputs.is_empty() {
            prompt.push_str("\n\n# Results of earlier tasks\n");
            for (task_id, output) in &self.dependency_outputs {
                prompt.push_str(&format!("\n## {task_id}\n{}\n", output.trim_end()));
            }
        }
        prompt
    }
}

/// Executes one task on behalf of a role.
///
/// Any error is treated as a failed attempt; [`AgentError::is_transient`]
/// decides whether another attempt is worth making.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute_task(
        &self,
        description: &str,
        role: &Role,
        context: &AgentContext,
    ) -> Result<Value, AgentError>;
}
