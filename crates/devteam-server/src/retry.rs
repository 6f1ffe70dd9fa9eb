//! Retry with exponential backoff around a single task.
//!
//! Each attempt's outcome is classified into [`AttemptResult`]. Transient
//! failures are retried after `backoff_unit * 2^attempt`; fatal failures and
//! exhausted retries fall through to the task's criticality: critical tasks
//! surface a [`CriticalTaskFailure`], best-effort tasks come back skipped.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use devteam_agent::{AgentContext, AgentError, TaskExecutor};
use devteam_core::{ProgressEvent, Role, RunStatus, TaskDefinition, TaskId, TaskOutput};
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::broadcast::ProgressBroadcast;
use crate::metrics::Metrics;

/// How often and how patiently a task is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub backoff_unit: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_unit: Duration) -> Self {
        Self {
            max_retries,
            backoff_unit,
        }
    }

    /// Total attempts including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay after failed attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_unit
            .saturating_mul(2u32.saturating_pow(attempt))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

/// Outcome of one attempt.
#[derive(Debug)]
pub enum AttemptResult {
    Success(Value),
    TransientFailure(AgentError),
    FatalFailure(AgentError),
}

impl From<Result<Value, AgentError>> for AttemptResult {
    fn from(result: Result<Value, AgentError>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(e) if e.is_transient() => Self::TransientFailure(e),
            Err(e) => Self::FatalFailure(e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Error(String),
}

/// Record of one execution try.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub task_id: TaskId,
    pub attempt_number: u32,
    pub started_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub backoff_before_next: Option<Duration>,
}

/// What the coordinator records for a finished task.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub output: TaskOutput,
    /// The executor's value on success, unchanged.
    pub value: Option<Value>,
    pub attempts: Vec<Attempt>,
}

impl TaskResult {
    pub fn is_skipped(&self) -> bool {
        self.output.is_skipped()
    }
}

/// A critical task that could not be completed.
#[derive(Debug, Clone, Error)]
#[error("Critical task '{task_name}' ({task_id}) failed after {attempts} attempt(s): {error}")]
pub struct CriticalTaskFailure {
    pub task_id: TaskId,
    pub task_name: String,
    /// Verbatim last error.
    pub error: String,
    pub attempts: u32,
}

/// Inputs for one task execution.
pub struct TaskRequest<'a> {
    pub task: &'a TaskDefinition,
    pub description: &'a str,
    pub role: &'a Role,
    pub context: AgentContext,
    /// Progress to report on per-attempt events.
    pub progress_percent: u8,
}

/// Runs a task through the executor with retries.
#[derive(Clone)]
pub struct RetryExecutor {
    executor: Arc<dyn TaskExecutor>,
    broadcast: Arc<ProgressBroadcast>,
    metrics: Arc<Metrics>,
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(
        executor: Arc<dyn TaskExecutor>,
        broadcast: Arc<ProgressBroadcast>,
        metrics: Arc<Metrics>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            executor,
            broadcast,
            metrics,
            policy,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Execute `request.task`, publishing one progress event per attempt.
    pub async fn execute(&self, request: TaskRequest<'_>) -> Result<TaskResult, CriticalTaskFailure> {
        let TaskRequest {
            task,
            description,
            role,
            mut context,
            progress_percent,
        } = request;
        let max_attempts = self.policy.max_attempts();
        let mut attempts: Vec<Attempt> = Vec::new();
        let mut last_error = String::new();

        for attempt_number in 1..=max_attempts {
            context.attempt = attempt_number;
            self.metrics.record_attempt(attempt_number > 1);

            let mut event = ProgressEvent::new(
                context.run_id.clone(),
                RunStatus::Running,
                format!("{} (attempt {attempt_number}/{max_attempts})", task.name),
                progress_percent,
            )
            .with_task(task.id.clone())
            .with_attempt(attempt_number);
            if attempt_number > 1 {
                event = event.with_error(last_error.clone());
            }
            self.broadcast.publish(event);

            let started_at = Utc::now();
            let result: AttemptResult = self
                .executor
                .execute_task(description, role, &context)
                .await
                .into();

            let (error, retryable) = match result {
                AttemptResult::Success(value) => {
                    attempts.push(Attempt {
                        task_id: task.id.clone(),
                        attempt_number,
                        started_at,
                        outcome: AttemptOutcome::Success,
                        backoff_before_next: None,
                    });
                    info!(
                        run_id = %context.run_id,
                        task_id = %task.id,
                        attempt = attempt_number,
                        "Task succeeded"
                    );
                    return Ok(TaskResult {
                        output: TaskOutput::from_value(value.clone()),
                        value: Some(value),
                        attempts,
                    });
                }
                AttemptResult::TransientFailure(e) => (e.to_string(), true),
                AttemptResult::FatalFailure(e) => (e.to_string(), false),
            };

            let backoff = (retryable && attempt_number < max_attempts)
                .then(|| self.policy.backoff(attempt_number));
            attempts.push(Attempt {
                task_id: task.id.clone(),
                attempt_number,
                started_at,
                outcome: AttemptOutcome::Error(error.clone()),
                backoff_before_next: backoff,
            });
            last_error = error;

            match backoff {
                Some(delay) => {
                    warn!(
                        run_id = %context.run_id,
                        task_id = %task.id,
                        attempt = attempt_number,
                        max_attempts,
                        backoff_secs = delay.as_secs_f64(),
                        error = %last_error,
                        "Task attempt failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    if !retryable {
                        warn!(
                            run_id = %context.run_id,
                            task_id = %task.id,
                            error = %last_error,
                            "Task failed with a non-retryable error"
                        );
                    }
                    break;
                }
            }
        }

        let attempt_count = attempts.len() as u32;
        if task.is_critical() {
            error!(
                run_id = %context.run_id,
                task_id = %task.id,
                attempts = attempt_count,
                error = %last_error,
                "Critical task failed"
            );
            self.metrics.record_critical_failure();
            return Err(CriticalTaskFailure {
                task_id: task.id.clone(),
                task_name: task.name.clone(),
                error: last_error,
                attempts: attempt_count,
            });
        }

        warn!(
            run_id = %context.run_id,
            task_id = %task.id,
            attempts = attempt_count,
            error = %last_error,
            "Best-effort task skipped after failure"
        );
        self.metrics.record_skip();
        Ok(TaskResult {
            output: TaskOutput::SkippedAfterFailure { error: last_error },
            value: None,
            attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use devteam_core::{Criticality, RunId};
    use tokio::time::Instant;

    use crate::testing::{role, ScriptedExecutor};

    fn transient(msg: &str) -> Result<Value, AgentError> {
        Err(AgentError::Process(msg.to_string()))
    }

    async fn run(
        executor: Arc<ScriptedExecutor>,
        task: &TaskDefinition,
        broadcast: Arc<ProgressBroadcast>,
    ) -> Result<TaskResult, CriticalTaskFailure> {
        let retry = RetryExecutor::new(
            executor,
            broadcast,
            Arc::new(Metrics::default()),
            RetryPolicy::default(),
        );
        let role = role();
        retry
            .execute(TaskRequest {
                task,
                description: "do it",
                role: &role,
                context: AgentContext::new(RunId::new("r"), task.id.clone(), "/tmp"),
                progress_percent: 10,
            })
            .await
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 4);
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(3), Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_timing_between_attempts() {
        let executor = ScriptedExecutor::new(vec![
            transient("one"),
            transient("two"),
            transient("three"),
            Ok(Value::String("finally".into())),
        ]);
        let task = TaskDefinition::new("t", "dev");

        let result = run(executor.clone(), &task, ProgressBroadcast::new())
            .await
            .unwrap();
        assert_eq!(result.output.text(), "finally");
        assert_eq!(result.attempts.len(), 4);
        assert_eq!(
            result.attempts[0].backoff_before_next,
            Some(Duration::from_secs(2))
        );

        let times = executor.call_times();
        let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            gaps,
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_exhaustion_is_failure() {
        let executor = ScriptedExecutor::new(vec![
            transient("a"),
            transient("b"),
            transient("c"),
            transient("last words"),
        ]);
        let task = TaskDefinition::new("req", "dev")
            .with_name("Requirements")
            .with_criticality(Criticality::Critical);

        let failure = run(executor.clone(), &task, ProgressBroadcast::new())
            .await
            .unwrap_err();
        assert_eq!(failure.task_id, TaskId::from("req"));
        assert_eq!(failure.task_name, "Requirements");
        assert_eq!(failure.attempts, 4);
        assert_eq!(
            failure.error,
            "Agent process exited with error: last words"
        );
        assert_eq!(executor.call_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_best_effort_exhaustion_is_skip() {
        let executor = ScriptedExecutor::new(vec![
            transient("a"),
            transient("b"),
            transient("c"),
            transient("d"),
        ]);
        let task = TaskDefinition::new("docs", "dev");

        let result = run(executor, &task, ProgressBroadcast::new()).await.unwrap();
        assert!(result.is_skipped());
        assert_eq!(result.output.text(), "Agent process exited with error: d");
        assert!(result.value.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_stops_retrying() {
        let executor = ScriptedExecutor::new(vec![Err(AgentError::ClaudeNotFound(
            "claude".into(),
        ))]);
        let task = TaskDefinition::new("t", "dev").with_criticality(Criticality::Critical);

        let started = Instant::now();
        let failure = run(executor.clone(), &task, ProgressBroadcast::new())
            .await
            .unwrap_err();
        assert_eq!(failure.attempts, 1);
        assert_eq!(executor.call_count(), 1);
        assert_eq!(Instant::now() - started, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_event_per_attempt() {
        let broadcast = ProgressBroadcast::new();
        let mut sub = broadcast.subscribe(&RunId::new("r"));
        let executor = ScriptedExecutor::new(vec![transient("flaky"), Ok(Value::Null)]);
        let task = TaskDefinition::new("t", "dev");

        run(executor, &task, broadcast.clone()).await.unwrap();

        let first = sub.try_recv().unwrap();
        assert_eq!(first.attempt, Some(1));
        assert!(first.error.is_none());
        let second = sub.try_recv().unwrap();
        assert_eq!(second.attempt, Some(2));
        assert_eq!(
            second.error.as_deref(),
            Some("Agent process exited with error: flaky")
        );
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn test_attempt_result_classification() {
        assert!(matches!(
            AttemptResult::from(Ok(Value::Null)),
            AttemptResult::Success(_)
        ));
        assert!(matches!(
            AttemptResult::from(transient("x")),
            AttemptResult::TransientFailure(_)
        ));
        assert!(matches!(
            AttemptResult::from(Err(AgentError::Rejected("x".into()))),
            AttemptResult::FatalFailure(_)
        ));
    }
}
