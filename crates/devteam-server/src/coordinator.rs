//! Drives one run through its task graph.
//!
//! `initializing -> running -> {completed | failed}`. Tasks execute one at a
//! time: the highest-priority ready task is handed to the retry executor, its
//! output is appended to the run state and checkpointed before the next task
//! is picked. Cancellation is observed between tasks only.

use std::sync::Arc;

use devteam_agent::AgentContext;
use devteam_core::{
    ProgressEvent, Role, RunFailure, RunState, RunStatus, TaskDefinition, TaskGraph, TaskOutput,
    TeamConfig,
};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::broadcast::ProgressBroadcast;
use crate::checkpoint::CheckpointStore;
use crate::metrics::Metrics;
use crate::results;
use crate::retry::{RetryExecutor, TaskRequest};

/// Shared collaborators every coordinator uses.
#[derive(Clone)]
pub struct Engine {
    pub team: Arc<TeamConfig>,
    pub retry: RetryExecutor,
    pub store: Arc<CheckpointStore>,
    pub broadcast: Arc<ProgressBroadcast>,
    pub metrics: Arc<Metrics>,
    pub write_results: bool,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed(RunFailure),
}

/// Agent context for `task` without any dependency outputs.
pub(crate) fn task_context(state: &RunState, task: &TaskDefinition, role: &Role) -> AgentContext {
    let options = &state.process_options;
    let mut context = AgentContext::new(
        state.run_id.clone(),
        task.id.clone(),
        state.target_directory.clone(),
    );
    context.task_name = task.name.clone();
    context.sprint_number = state.sprint_number;
    context.tools = role.allowed_tools(&options.tool_selection);
    context.delegation = options.delegation;
    context
}

/// Owns the execution of a single run.
pub struct RunCoordinator {
    engine: Engine,
    graph: Arc<TaskGraph>,
    state: Arc<RwLock<RunState>>,
    cancel: CancellationToken,
}

impl RunCoordinator {
    pub fn new(
        engine: Engine,
        graph: Arc<TaskGraph>,
        state: Arc<RwLock<RunState>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            engine,
            graph,
            state,
            cancel,
        }
    }

    fn event(&self, state: &RunState, message: impl Into<String>) -> ProgressEvent {
        ProgressEvent::new(
            state.run_id.clone(),
            state.status,
            message,
            state.progress_percent(self.graph.len()),
        )
    }

    /// Run to completion, failure or cancellation.
    pub async fn run(self) -> RunOutcome {
        {
            let state = self.state.read().await;
            let order: Vec<&str> = self
                .graph
                .resolve_order()
                .iter()
                .map(|id| id.as_str())
                .collect();
            info!(
                run_id = %state.run_id,
                sprint = state.sprint_number,
                tasks = self.graph.len(),
                already_completed = state.completed_task_ids.len(),
                order = ?order,
                "Run initializing"
            );
            let message = format!(
                "Run initialized: {} tasks, {} already completed",
                self.graph.len(),
                state.completed_task_ids.len()
            );
            self.engine.broadcast.publish(self.event(&state, message));
        }

        {
            let mut state = self.state.write().await;
            state.mark_running();
            self.engine
                .broadcast
                .publish(self.event(&state, format!("Sprint {} started", state.sprint_number)));
        }

        loop {
            if self.cancel.is_cancelled() {
                return self.finish_cancelled().await;
            }

            let next = {
                let state = self.state.read().await;
                self.graph.next_ready(&state.completed_set()).cloned()
            };
            let Some(task) = next else {
                break;
            };

            if let Err(failure) = self.execute(&task).await {
                return self.finish_failed(failure).await;
            }
        }

        self.finish_completed().await
    }

    async fn execute(&self, task: &TaskDefinition) -> Result<(), RunFailure> {
        let Some(role) = self.engine.team.role(&task.owning_role) else {
            return Err(RunFailure::critical_task(
                task.id.clone(),
                task.name.clone(),
                format!("role '{}' is not defined", task.owning_role),
            ));
        };

        let (context, description, progress) = {
            let mut state = self.state.write().await;
            state.current_task_id = Some(task.id.clone());
            state.touch();
            info!(run_id = %state.run_id, task_id = %task.id, role = %role.id, "Starting task");
            self.engine
                .broadcast
                .publish(self.event(&state, format!("Starting {}", task.name)).with_task(task.id.clone()));

            (
                self.agent_context(&state, task, role),
                task.render_description(&state.params()),
                state.progress_percent(self.graph.len()),
            )
        };

        let result = self
            .engine
            .retry
            .execute(TaskRequest {
                task,
                description: &description,
                role,
                context,
                progress_percent: progress,
            })
            .await
            .map_err(|failure| {
                RunFailure::critical_task(failure.task_id, failure.task_name, failure.error)
            })?;

        let snapshot = {
            let mut state = self.state.write().await;
            state.record_output(task.id.clone(), result.output.clone());

            let mut event = match &result.output {
                TaskOutput::Success { .. } => {
                    self.event(&state, format!("Completed {}", task.name))
                }
                TaskOutput::SkippedAfterFailure { error } => {
                    self.event(&state, format!("Skipped {} after failure", task.name))
                        .with_error(error.clone())
                }
            };
            event = event.with_task(task.id.clone());
            if let Some(value) = result.value {
                event = event.with_result(value);
            }
            self.engine.broadcast.publish(event);
            state.clone()
        };

        self.save_checkpoint(&snapshot).await;
        Ok(())
    }

    fn agent_context(&self, state: &RunState, task: &TaskDefinition, role: &Role) -> AgentContext {
        let mut context = task_context(state, task, role);
        if state.process_options.memory {
            context.dependency_outputs = task
                .dependency_ids
                .iter()
                .filter_map(|dep| match state.task_outputs.get(dep) {
                    Some(TaskOutput::Success { result }) => Some((dep.clone(), result.clone())),
                    _ => None,
                })
                .collect();
        }
        context
    }

    async fn save_checkpoint(&self, snapshot: &RunState) {
        if let Err(e) = self.engine.store.save(snapshot).await {
            self.engine.metrics.record_checkpoint_failure();
            warn!(
                run_id = %snapshot.run_id,
                error = %e,
                "Checkpoint save failed; continuing with in-memory state"
            );
        }
    }

    async fn finish_completed(self) -> RunOutcome {
        let snapshot = {
            let mut state = self.state.write().await;
            debug_assert_eq!(state.completed_task_ids.len(), self.graph.len());
            state.mark_completed();
            state.clone()
        };
        info!(
            run_id = %snapshot.run_id,
            skipped = snapshot.skipped_task_ids().len(),
            "Run completed"
        );

        if self.engine.write_results {
            if let Err(e) = results::write_sprint_results(&snapshot, &self.graph).await {
                warn!(run_id = %snapshot.run_id, error = %e, "Failed to write sprint results");
            }
        }

        let outputs = serde_json::to_value(&snapshot.task_outputs).unwrap_or_default();
        self.engine.broadcast.publish(
            self.event(&snapshot, format!("Sprint {} completed", snapshot.sprint_number))
                .with_result(outputs),
        );
        RunOutcome::Completed
    }

    async fn finish_failed(self, failure: RunFailure) -> RunOutcome {
        let snapshot = {
            let mut state = self.state.write().await;
            state.mark_failed(failure.clone());
            state.clone()
        };
        error!(
            run_id = %snapshot.run_id,
            task_id = failure.task_id.as_ref().map(|t| t.as_str()).unwrap_or(""),
            error = %failure.message,
            "Run failed"
        );
        self.save_checkpoint(&snapshot).await;

        let name = failure.task_name.as_deref().unwrap_or("task");
        let mut event = self
            .event(&snapshot, format!("Run failed: {name} could not be completed"))
            .with_error(failure.message.clone());
        if let Some(task_id) = &failure.task_id {
            event = event.with_task(task_id.clone());
        }
        self.engine.broadcast.publish(event);
        RunOutcome::Failed(failure)
    }

    async fn finish_cancelled(self) -> RunOutcome {
        let failure = RunFailure::cancelled("Run cancelled");
        let snapshot = {
            let mut state = self.state.write().await;
            state.mark_failed(failure.clone());
            state.clone()
        };
        info!(
            run_id = %snapshot.run_id,
            completed = snapshot.completed_task_ids.len(),
            "Run cancelled"
        );
        debug_assert_eq!(snapshot.status, RunStatus::Failed);
        self.save_checkpoint(&snapshot).await;
        self.engine.broadcast.publish(
            self.event(&snapshot, "Run cancelled")
                .with_error(failure.message.clone()),
        );
        RunOutcome::Failed(failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devteam_core::{Criticality, FailureReason, ProcessOptions, RunId, TaskId};
    use tempfile::TempDir;

    use crate::testing::{engine, team, ScriptedExecutor};

    fn ids(names: &[&str]) -> Vec<TaskId> {
        names.iter().map(|n| TaskId::from(*n)).collect()
    }

    struct Harness {
        coordinator: RunCoordinator,
        state: Arc<RwLock<RunState>>,
        store: Arc<CheckpointStore>,
        dir: TempDir,
    }

    fn harness(team: TeamConfig, executor: Arc<ScriptedExecutor>) -> Harness {
        harness_with(team, executor, RunState::new(RunId::new("run"), "goal", "/tmp"))
    }

    fn harness_with(
        team: TeamConfig,
        executor: Arc<ScriptedExecutor>,
        initial: RunState,
    ) -> Harness {
        let dir = TempDir::new().unwrap();
        let graph = Arc::new(team.build_graph().unwrap());
        let engine = engine(team, executor, dir.path());
        let state = Arc::new(RwLock::new(initial));
        let store = engine.store.clone();
        Harness {
            coordinator: RunCoordinator::new(
                engine,
                graph,
                state.clone(),
                CancellationToken::new(),
            ),
            state,
            store,
            dir,
        }
    }

    fn diamond(criticality: &[(&str, Criticality)]) -> TeamConfig {
        let crit = |id: &str| {
            criticality
                .iter()
                .find(|(t, _)| *t == id)
                .map_or(Criticality::BestEffort, |(_, c)| *c)
        };
        team(&[
            ("A", &[], crit("A")),
            ("B", &["A"], crit("B")),
            ("C", &["A"], crit("C")),
            ("D", &["B", "C"], crit("D")),
        ])
    }

    #[tokio::test]
    async fn test_diamond_completes_in_dependency_order() {
        let executor = ScriptedExecutor::succeeding();
        let h = harness(diamond(&[]), executor.clone());

        assert_eq!(h.coordinator.run().await, RunOutcome::Completed);

        let state = h.state.read().await;
        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.completed_task_ids[0], TaskId::from("A"));
        assert_eq!(state.completed_task_ids[3], TaskId::from("D"));
        let middle: std::collections::HashSet<_> =
            state.completed_task_ids[1..3].iter().cloned().collect();
        assert_eq!(middle, ids(&["B", "C"]).into_iter().collect());
        assert_eq!(executor.executed(), state.completed_task_ids);
        assert!(state.current_task_id.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_failure_fails_run() {
        let executor = ScriptedExecutor::failing(&["B"]);
        let h = harness(diamond(&[("B", Criticality::Critical)]), executor.clone());

        let outcome = h.coordinator.run().await;
        let RunOutcome::Failed(failure) = outcome else {
            panic!("expected failure");
        };
        assert_eq!(failure.reason, FailureReason::CriticalTask);
        assert_eq!(failure.task_id, Some(TaskId::from("B")));
        assert_eq!(failure.task_name.as_deref(), Some("B"));
        assert_eq!(failure.message, "Agent process exited with error: B is broken");

        let state = h.state.read().await;
        assert_eq!(state.status, RunStatus::Failed);
        assert!(!state.completed_task_ids.contains(&TaskId::from("B")));
        assert!(!state.completed_task_ids.contains(&TaskId::from("D")));
        assert_eq!(state.failure.as_ref(), Some(&failure));
        // Four attempts at B, nothing after it.
        assert!(!executor.executed().contains(&TaskId::from("D")));
        assert_eq!(
            executor.executed().iter().filter(|t| t.as_str() == "B").count(),
            4
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_best_effort_failure_is_skipped() {
        let executor = ScriptedExecutor::failing(&["C"]);
        let h = harness(diamond(&[]), executor.clone());

        assert_eq!(h.coordinator.run().await, RunOutcome::Completed);

        let state = h.state.read().await;
        assert_eq!(state.completed_task_ids.len(), 4);
        assert!(state.task_outputs[&TaskId::from("C")].is_skipped());
        assert_eq!(state.skipped_task_ids(), ids(&["C"]));
        assert!(executor.executed().contains(&TaskId::from("D")));
    }

    #[tokio::test]
    async fn test_resume_skips_completed_tasks() {
        let executor = ScriptedExecutor::succeeding();
        let mut initial = RunState::new(RunId::new("run"), "goal", "/tmp");
        initial.record_output("A".into(), TaskOutput::Success { result: "from before".into() });

        let two = team(&[("A", &[], Criticality::Critical), ("B", &["A"], Criticality::BestEffort)]);
        let h = harness_with(two, executor.clone(), initial);

        assert_eq!(h.coordinator.run().await, RunOutcome::Completed);
        assert_eq!(executor.executed(), ids(&["B"]));

        let state = h.state.read().await;
        assert_eq!(state.completed_task_ids, ids(&["A", "B"]));
        assert_eq!(state.task_outputs[&TaskId::from("A")].text(), "from before");
    }

    #[tokio::test]
    async fn test_progress_events_are_ordered_and_end_terminal() {
        let executor = ScriptedExecutor::succeeding();
        let h = harness(diamond(&[]), executor);
        let broadcast = h.coordinator.engine.broadcast.clone();
        let mut sub = broadcast.subscribe(&RunId::new("run"));

        h.coordinator.run().await;

        let mut events = Vec::new();
        while let Some(event) = sub.try_recv() {
            events.push(event);
        }
        let percents: Vec<u8> = events.iter().map(|e| e.progress_percent).collect();
        assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{percents:?}");
        assert_eq!(events[0].status, RunStatus::Initializing);

        let last = events.last().unwrap();
        assert_eq!(last.status, RunStatus::Completed);
        assert_eq!(last.progress_percent, 100);
        assert!(last.result.is_some());
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_before_start_runs_nothing() {
        let executor = ScriptedExecutor::succeeding();
        let h = harness(diamond(&[]), executor.clone());
        h.coordinator.cancel.cancel();

        let RunOutcome::Failed(failure) = h.coordinator.run().await else {
            panic!("expected cancellation");
        };
        assert_eq!(failure.reason, FailureReason::Cancelled);
        assert_eq!(executor.call_count(), 0);
        assert_eq!(h.state.read().await.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancel_lets_current_task_finish() {
        let executor = ScriptedExecutor::succeeding();
        let h = harness(diamond(&[]), executor.clone());
        executor.cancel_on_call(h.coordinator.cancel.clone());

        let RunOutcome::Failed(failure) = h.coordinator.run().await else {
            panic!("expected cancellation");
        };
        assert_eq!(failure.reason, FailureReason::Cancelled);
        assert_eq!(executor.executed(), ids(&["A"]));

        let state = h.state.read().await;
        assert_eq!(state.completed_task_ids, ids(&["A"]));
        // The finished task was checkpointed before the run stopped.
        let saved = h
            .store
            .load(&RunId::new("run"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(saved.completed_task_ids, ids(&["A"]));
        assert!(saved.is_failed());
        assert_eq!(
            saved.failure.map(|f| f.reason),
            Some(FailureReason::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_checkpoint_save_failure_does_not_abort_run() {
        let executor = ScriptedExecutor::succeeding();
        let h = harness(diamond(&[]), executor.clone());
        // A regular file where the checkpoint directory should be.
        std::fs::write(h.dir.path().join("checkpoints"), b"not a directory").unwrap();
        let metrics = h.coordinator.engine.metrics.clone();

        assert_eq!(h.coordinator.run().await, RunOutcome::Completed);

        let state = h.state.read().await;
        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.completed_task_ids.len(), 4);
        assert_eq!(metrics.checkpoint_failures(), 4);
        assert!(h.store.load(&RunId::new("run")).await.is_err());
    }

    #[tokio::test]
    async fn test_memory_controls_dependency_outputs() {
        let executor = ScriptedExecutor::succeeding();
        let two = team(&[("A", &[], Criticality::BestEffort), ("B", &["A"], Criticality::BestEffort)]);
        let h = harness(two.clone(), executor.clone());
        h.coordinator.run().await;

        let calls = executor.calls();
        assert_eq!(
            calls[1].context.dependency_outputs,
            vec![(TaskId::from("A"), "A done".to_string())]
        );

        let forgetful = ScriptedExecutor::succeeding();
        let mut initial = RunState::new(RunId::new("run"), "goal", "/tmp");
        initial.process_options = ProcessOptions {
            memory: false,
            ..ProcessOptions::default()
        };
        let h = harness_with(two, forgetful.clone(), initial);
        h.coordinator.run().await;
        assert!(forgetful.calls()[1].context.dependency_outputs.is_empty());
    }

    #[tokio::test]
    async fn test_descriptions_are_rendered_from_run_params() {
        let executor = ScriptedExecutor::succeeding();
        let mut one = team(&[("A", &[], Criticality::BestEffort)]);
        one.tasks[0].description = "Build {goal} (sprint {sprint_number}) {unknown}".into();
        let h = harness(one, executor.clone());
        h.coordinator.run().await;

        assert_eq!(executor.calls()[0].description, "Build goal (sprint 1) {unknown}");
    }
}
