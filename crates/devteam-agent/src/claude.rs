//! Claude Code executor for running role agents via subprocess.
//!
//! Each task is a one-shot `claude --print` invocation with streaming JSON
//! output, run inside the run's target directory.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use devteam_core::Role;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::error::AgentError;
use crate::executor::{AgentContext, TaskExecutor};
use crate::types::{ClaudeMessage, PermissionMode};

/// Result of a Claude Code execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    /// The session ID from Claude Code.
    pub session_id: Option<String>,

    /// Final answer text.
    pub text: String,

    /// Duration of execution in milliseconds.
    pub duration_ms: u64,

    pub num_turns: Option<u32>,
}

/// Folds stream-json messages into an [`ExecutionResult`].
#[derive(Debug, Default)]
struct StreamCollector {
    session_id: Option<String>,
    assistant_text: Vec<String>,
    result_text: Option<String>,
    error: Option<String>,
    num_turns: Option<u32>,
    duration_ms: Option<u64>,
    messages: u64,
}

impl StreamCollector {
    fn observe_line(&mut self, line: &str) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }
        match serde_json::from_str::<ClaudeMessage>(trimmed) {
            Ok(message) => self.observe(message),
            Err(e) => {
                let preview: String = trimmed.chars().take(200).collect();
                warn!(error = %e, preview = %preview, "Failed to parse Claude message");
            }
        }
    }

    fn observe(&mut self, message: ClaudeMessage) {
        self.messages += 1;
        if self.session_id.is_none() {
            self.session_id = message.session_id().map(str::to_string);
        }

        match message {
            ClaudeMessage::Assistant { message, .. } => {
                let text = message.text();
                if !text.is_empty() {
                    self.assistant_text.push(text);
                }
            }
            ClaudeMessage::Result {
                is_error,
                result,
                error,
                num_turns,
                duration_ms,
                subtype,
                ..
            } => {
                self.num_turns = num_turns;
                self.duration_ms = duration_ms;
                let text = match result {
                    Some(Value::String(s)) => Some(s),
                    Some(Value::Null) | None => None,
                    Some(other) => Some(other.to_string()),
                };
                if is_error.unwrap_or(false) {
                    self.error = Some(
                        error
                            .or(text)
                            .or(subtype)
                            .unwrap_or_else(|| "unknown error".to_string()),
                    );
                } else {
                    self.result_text = text;
                }
            }
            ClaudeMessage::System { .. } | ClaudeMessage::User { .. } => {}
            ClaudeMessage::Unknown(value) => {
                debug!(message = %value, "Ignoring unknown Claude message");
            }
        }
    }

    fn finish(self, elapsed: Duration) -> Result<ExecutionResult, AgentError> {
        if let Some(error) = self.error {
            return Err(AgentError::Reported(error));
        }
        let text = match self.result_text {
            Some(text) => text,
            None if !self.assistant_text.is_empty() => self.assistant_text.join("\n"),
            None => {
                return Err(AgentError::Protocol(format!(
                    "no result in {} messages",
                    self.messages
                )))
            }
        };
        Ok(ExecutionResult {
            session_id: self.session_id,
            text,
            duration_ms: self
                .duration_ms
                .unwrap_or_else(|| elapsed.as_millis() as u64),
            num_turns: self.num_turns,
        })
    }
}

/// Executor that runs each task through the Claude Code CLI.
#[derive(Debug, Clone)]
pub struct ClaudeExecutor {
    /// Path to the Claude CLI executable.
    claude_path: String,

    /// Permission mode to use.
    permission_mode: PermissionMode,

    /// Model to use (optional).
    model: Option<String>,

    /// Per-task wall-clock limit (optional).
    timeout: Option<Duration>,

    /// Additional environment variables.
    env_vars: Vec<(String, String)>,
}

impl ClaudeExecutor {
    /// Create a new executor with the given path to the Claude CLI.
    ///
    /// The path can be just "claude" to use PATH lookup, or a full path.
    pub fn new(claude_path: impl Into<String>) -> Self {
        Self {
            claude_path: claude_path.into(),
            permission_mode: PermissionMode::Default,
            model: None,
            timeout: None,
            env_vars: Vec::new(),
        }
    }

    /// Set the permission mode.
    pub fn with_permission_mode(mut self, mode: PermissionMode) -> Self {
        self.permission_mode = mode;
        self
    }

    /// Set the model to use.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Limit how long a single task may run.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    /// System prompt describing the role the agent plays.
    pub fn system_prompt(role: &Role, context: &AgentContext) -> String {
        let mut prompt = format!("You are the {} of a software development team.", role.title);
        if !role.goal.is_empty() {
            prompt.push_str(&format!("\nYour goal: {}", role.goal));
        }
        if !role.backstory.is_empty() {
            prompt.push_str(&format!("\n{}", role.backstory));
        }
        if !context.tools.is_empty() {
            prompt.push_str(&format!(
                "\nCapabilities you may draw on: {}.",
                context.tools.join(", ")
            ));
        }
        if !context.delegation {
            prompt.push_str("\nDo the work yourself; do not hand it off to other roles.");
        }
        prompt.push_str(&format!(
            "\nThis is sprint {} and you are working on the task '{}'.",
            context.sprint_number, context.task_name
        ));
        prompt
    }

    /// Run one prompt to completion.
    pub async fn run(
        &self,
        working_dir: &Path,
        prompt: &str,
        system_prompt: &str,
    ) -> Result<ExecutionResult, AgentError> {
        let started = Instant::now();
        let exec = self.run_inner(working_dir, prompt, system_prompt, started);
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, exec)
                .await
                .map_err(|_| AgentError::Timeout(limit))?,
            None => exec.await,
        }
    }

    async fn run_inner(
        &self,
        working_dir: &Path,
        prompt: &str,
        system_prompt: &str,
        started: Instant,
    ) -> Result<ExecutionResult, AgentError> {
        // spawn() reports a missing cwd as NotFound, same as a missing binary.
        let is_dir = tokio::fs::metadata(working_dir)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Err(AgentError::WorkingDirMissing(working_dir.to_path_buf()));
        }

        let mut cmd = Command::new(&self.claude_path);
        cmd.arg("--output-format=stream-json")
            .arg("--verbose")
            .arg("--permission-mode")
            .arg(self.permission_mode.as_str())
            .arg("--append-system-prompt")
            .arg(system_prompt);

        if let Some(model) = &self.model {
            cmd.arg("--model").arg(model);
        }

        cmd.arg("--print").arg(prompt);

        // No stdin in one-shot mode; the child dies with us on timeout.
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(working_dir)
            .kill_on_drop(true);

        for (key, value) in &self.env_vars {
            cmd.env(key, value);
        }

        info!(
            claude_path = %self.claude_path,
            working_dir = %working_dir.display(),
            prompt_len = prompt.len(),
            model = self.model.as_deref().unwrap_or("default"),
            "Spawning Claude process"
        );

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AgentError::ClaudeNotFound(self.claude_path.clone())
            } else {
                error!(error = %e, "Failed to spawn Claude process");
                AgentError::Spawn(e)
            }
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Protocol("Failed to get stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AgentError::Protocol("Failed to get stderr".to_string()))?;

        // Keep the tail of stderr for the error message.
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut tail: Vec<String> = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                warn!(stderr = %trimmed, "Claude stderr");
                if tail.len() == 5 {
                    tail.remove(0);
                }
                tail.push(trimmed.to_string());
            }
            tail.join("\n")
        });

        let mut collector = StreamCollector::default();
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            collector.observe_line(&line);
        }

        let status = child.wait().await?;
        let stderr_tail = stderr_task.await.unwrap_or_default();
        let exit_code = status.code().unwrap_or(-1);
        info!(
            exit_code,
            messages = collector.messages,
            session_id = collector.session_id.as_deref().unwrap_or("unknown"),
            "Claude process exited"
        );

        if !status.success() {
            let mut message = format!("Claude exited with code {exit_code}");
            if !stderr_tail.is_empty() {
                message.push_str(": ");
                message.push_str(&stderr_tail);
            }
            return Err(AgentError::Process(message));
        }

        collector.finish(started.elapsed())
    }
}

impl Default for ClaudeExecutor {
    fn default() -> Self {
        Self::new("claude")
    }
}

#[async_trait]
impl TaskExecutor for ClaudeExecutor {
    async fn execute_task(
        &self,
        description: &str,
        role: &Role,
        context: &AgentContext,
    ) -> Result<Value, AgentError> {
        let system_prompt = Self::system_prompt(role, context);
        let prompt = context.prompt(description);
        let result = self
            .run(&context.target_directory, &prompt, &system_prompt)
            .await?;

        info!(
            run_id = %context.run_id,
            task_id = %context.task_id,
            session_id = result.session_id.as_deref().unwrap_or("unknown"),
            duration_ms = result.duration_ms,
            "Agent finished task"
        );
        Ok(Value::String(result.text))
    }
}
