//! Run registry and lifecycle operations.
//!
//! The HTTP layer talks to runs only through [`RunService`]. Each accepted
//! run gets its own [`RunCoordinator`] spawned on the runtime; the service
//! keeps the shared state handle and the cancel token. Finished runs leave
//! the registry after a retention window; their checkpoints stay on disk.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use devteam_agent::TaskExecutor;
use devteam_core::{
    GraphIntegrityError, ReplayReport, ReplayRequest, RunAccepted, RunId, RunRequest, RunState,
    RunStatus, RunStatusView, TaskDefinition, TaskGraph, TaskId, TaskOutput, TeamConfig,
};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broadcast::{ProgressBroadcast, Subscription};
use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::coordinator::{task_context, Engine, RunCoordinator, RunOutcome};
use crate::metrics::Metrics;
use crate::results;
use crate::retry::{RetryExecutor, RetryPolicy, TaskRequest};

/// How long a finished run stays queryable by default.
pub const DEFAULT_RUN_RETENTION: Duration = Duration::from_secs(60 * 60);

/// Errors returned by run operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Run not found: {0}")]
    NotFound(RunId),

    #[error("{0}")]
    Conflict(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid task graph: {0}")]
    Graph(#[from] GraphIntegrityError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

fn failed_run_conflict(run_id: &RunId) -> ServiceError {
    ServiceError::Conflict(format!(
        "Run {run_id} has failed and cannot be resumed; start a new run with seed_from"
    ))
}

async fn prepare_target_directory(path: &Path) -> Result<(), ServiceError> {
    tokio::fs::create_dir_all(path).await.map_err(|e| {
        ServiceError::InvalidRequest(format!(
            "cannot create target directory '{}': {e}",
            path.display()
        ))
    })
}

/// Task picked by a replay request.
fn replay_target<'g>(
    graph: &'g TaskGraph,
    request: &ReplayRequest,
) -> Result<&'g TaskDefinition, ServiceError> {
    let task_id = match (&request.task_id, request.task_index) {
        (Some(task_id), _) => task_id,
        (None, Some(index)) => graph.resolve_order().get(index).ok_or_else(|| {
            ServiceError::InvalidRequest(format!(
                "task index {index} out of range (0-{})",
                graph.len().saturating_sub(1)
            ))
        })?,
        (None, None) => {
            return Err(ServiceError::InvalidRequest(
                "replay needs a task_id or a task_index".to_string(),
            ))
        }
    };
    graph
        .get(task_id)
        .ok_or_else(|| ServiceError::InvalidRequest(format!("unknown task '{task_id}'")))
}

/// A run known to this process.
struct RunEntry {
    state: Arc<RwLock<RunState>>,
    graph: Arc<TaskGraph>,
    cancel: CancellationToken,
    /// Cancelled once the coordinator task has returned.
    done: CancellationToken,
}

impl RunEntry {
    async fn view(&self) -> RunStatusView {
        self.state.read().await.view(self.graph.len())
    }
}

/// Owns every run and the collaborators they share.
pub struct RunService {
    engine: Engine,
    /// Graph of the configured team, for introspection.
    graph: Arc<TaskGraph>,
    runs: RwLock<HashMap<RunId, RunEntry>>,
    run_retention: Duration,
}

impl RunService {
    /// Build a service for `team`. Fails if the team does not form a valid
    /// task graph.
    pub fn new(
        team: TeamConfig,
        executor: Arc<dyn TaskExecutor>,
        store: CheckpointStore,
        policy: RetryPolicy,
    ) -> Result<Self, GraphIntegrityError> {
        let graph = Arc::new(team.build_graph()?);
        let broadcast = ProgressBroadcast::new();
        let metrics = Arc::new(Metrics::default());
        let retry = RetryExecutor::new(executor, broadcast.clone(), metrics.clone(), policy);

        Ok(Self {
            engine: Engine {
                team: Arc::new(team),
                retry,
                store: Arc::new(store),
                broadcast,
                metrics,
                write_results: true,
            },
            graph,
            runs: RwLock::new(HashMap::new()),
            run_retention: DEFAULT_RUN_RETENTION,
        })
    }

    /// Builder method to toggle writing sprint results on completion.
    pub fn with_write_results(mut self, enabled: bool) -> Self {
        self.engine.write_results = enabled;
        self
    }

    /// Builder method to set how long finished runs stay in the registry.
    pub fn with_run_retention(mut self, retention: Duration) -> Self {
        self.run_retention = retention;
        self
    }

    pub fn team(&self) -> &TeamConfig {
        &self.engine.team
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn broadcast(&self) -> &Arc<ProgressBroadcast> {
        &self.engine.broadcast
    }

    pub fn metrics(&self) -> &Metrics {
        &self.engine.metrics
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.engine.store
    }

    /// Accept a run request and start its coordinator.
    ///
    /// Checkpoint and directory I/O happen outside the registry lock; the
    /// registry is checked again right before the run is inserted.
    pub async fn start_run(&self, request: RunRequest) -> Result<RunAccepted, ServiceError> {
        request
            .validate()
            .map_err(|e| ServiceError::InvalidRequest(e.to_string()))?;
        let graph = Arc::new(self.engine.team.build_graph()?);

        let state = if request.resume {
            self.resumed_state(&graph, &request).await?
        } else {
            self.fresh_state(&graph, &request).await?
        };
        prepare_target_directory(&state.target_directory).await?;

        let mut runs = self.runs.write().await;
        Self::check_available(&runs, &state.run_id, request.resume).await?;
        self.evict_expired(&mut runs).await;
        Ok(self.launch(&mut runs, graph, state))
    }

    /// Fails if `run_id` is in the registry and may not be started again.
    async fn check_available(
        runs: &HashMap<RunId, RunEntry>,
        run_id: &RunId,
        resume: bool,
    ) -> Result<(), ServiceError> {
        let Some(entry) = runs.get(run_id) else {
            return Ok(());
        };
        if !resume {
            return Err(ServiceError::Conflict(format!(
                "Run {run_id} already exists; set resume to continue it"
            )));
        }
        match entry.state.read().await.status {
            RunStatus::Failed => Err(failed_run_conflict(run_id)),
            status if status.is_active() => Err(ServiceError::Conflict(format!(
                "Run {run_id} is already active"
            ))),
            _ => Ok(()),
        }
    }

    async fn resumed_state(
        &self,
        graph: &TaskGraph,
        request: &RunRequest,
    ) -> Result<RunState, ServiceError> {
        let Some(run_id) = request.run_id.clone() else {
            return Err(ServiceError::InvalidRequest(
                "resume requires a run_id".to_string(),
            ));
        };
        {
            let runs = self.runs.read().await;
            Self::check_available(&runs, &run_id, true).await?;
        }

        let checkpoint = self
            .engine
            .store
            .load(&run_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(run_id.clone()))?;
        if checkpoint.is_failed() {
            return Err(failed_run_conflict(&run_id));
        }
        let checkpoint = checkpoint.reconcile(graph);

        let mut state = RunState::from_request(run_id, request);
        state.sprint_number = checkpoint.sprint_number;
        checkpoint.apply_to(&mut state);
        info!(
            run_id = %state.run_id,
            completed = state.completed_task_ids.len(),
            "Resuming run from checkpoint"
        );
        Ok(state)
    }

    async fn fresh_state(
        &self,
        graph: &TaskGraph,
        request: &RunRequest,
    ) -> Result<RunState, ServiceError> {
        let run_id = match &request.run_id {
            Some(id) => {
                {
                    let runs = self.runs.read().await;
                    Self::check_available(&runs, id, false).await?;
                }
                if self.engine.store.exists(id).await? {
                    return Err(ServiceError::Conflict(format!(
                        "Run {id} already exists; set resume to continue it"
                    )));
                }
                id.clone()
            }
            None => RunId::generate(),
        };

        let mut state = RunState::from_request(run_id, request);
        if let Some(source) = &request.seed_from {
            let checkpoint = self
                .engine
                .store
                .load(source)
                .await?
                .ok_or_else(|| ServiceError::NotFound(source.clone()))?
                .reconcile(graph);
            checkpoint.apply_to(&mut state);
            info!(
                run_id = %state.run_id,
                seed_from = %source,
                completed = state.completed_task_ids.len(),
                "Seeding run from checkpoint"
            );
        }
        Ok(state)
    }

    fn launch(
        &self,
        runs: &mut HashMap<RunId, RunEntry>,
        graph: Arc<TaskGraph>,
        state: RunState,
    ) -> RunAccepted {
        let run_id = state.run_id.clone();
        let status = state.status;
        let state = Arc::new(RwLock::new(state));
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();

        let coordinator = RunCoordinator::new(
            self.engine.clone(),
            graph.clone(),
            state.clone(),
            cancel.clone(),
        );
        runs.insert(
            run_id.clone(),
            RunEntry {
                state,
                graph,
                cancel,
                done: done.clone(),
            },
        );

        let task_run_id = run_id.clone();
        tokio::spawn(async move {
            let _done = done.drop_guard();
            match coordinator.run().await {
                RunOutcome::Completed => debug!(run_id = %task_run_id, "Coordinator finished"),
                RunOutcome::Failed(failure) => debug!(
                    run_id = %task_run_id,
                    reason = ?failure.reason,
                    "Coordinator stopped"
                ),
            }
        });

        info!(run_id = %run_id, "Run accepted");
        RunAccepted { run_id, status }
    }

    /// Current status of a run.
    pub async fn status(&self, run_id: &RunId) -> Result<RunStatusView, ServiceError> {
        let runs = self.runs.read().await;
        let entry = runs
            .get(run_id)
            .ok_or_else(|| ServiceError::NotFound(run_id.clone()))?;
        Ok(entry.view().await)
    }

    /// Every known run, oldest first.
    pub async fn list_runs(&self) -> Vec<RunStatusView> {
        let runs = self.runs.read().await;
        let mut views = Vec::with_capacity(runs.len());
        for entry in runs.values() {
            views.push(entry.view().await);
        }
        views.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        views
    }

    /// Aggregated task outputs so far.
    pub async fn outputs(
        &self,
        run_id: &RunId,
    ) -> Result<BTreeMap<TaskId, TaskOutput>, ServiceError> {
        let runs = self.runs.read().await;
        let entry = runs
            .get(run_id)
            .ok_or_else(|| ServiceError::NotFound(run_id.clone()))?;
        let outputs = entry.state.read().await.task_outputs.clone();
        Ok(outputs)
    }

    /// Ask a run to stop before its next task.
    pub async fn cancel(&self, run_id: &RunId) -> Result<RunStatusView, ServiceError> {
        let runs = self.runs.read().await;
        let entry = runs
            .get(run_id)
            .ok_or_else(|| ServiceError::NotFound(run_id.clone()))?;

        let view = entry.view().await;
        if view.status.is_terminal() {
            return Err(ServiceError::Conflict(format!(
                "Run {run_id} is already {}",
                view.status
            )));
        }
        if !entry.cancel.is_cancelled() {
            info!(run_id = %run_id, "Cancellation requested");
            entry.cancel.cancel();
        }
        Ok(view)
    }

    /// Start the next sprint of a completed run.
    pub async fn submit_feedback(
        &self,
        run_id: &RunId,
        feedback: String,
    ) -> Result<RunAccepted, ServiceError> {
        let graph = Arc::new(self.engine.team.build_graph()?);
        let next = {
            let runs = self.runs.read().await;
            let entry = runs
                .get(run_id)
                .ok_or_else(|| ServiceError::NotFound(run_id.clone()))?;
            let previous = entry.state.read().await;
            if previous.status != RunStatus::Completed {
                return Err(ServiceError::Conflict(format!(
                    "Run {run_id} is {}; feedback is accepted only for completed runs",
                    previous.status
                )));
            }
            previous.next_sprint(RunId::generate(), feedback)
        };
        prepare_target_directory(&next.target_directory).await?;
        info!(
            run_id = %run_id,
            next_run_id = %next.run_id,
            sprint = next.sprint_number,
            "Feedback received; starting next sprint"
        );

        let mut runs = self.runs.write().await;
        self.evict_expired(&mut runs).await;
        Ok(self.launch(&mut runs, graph, next))
    }

    /// Re-execute one task of a finished run on its own.
    ///
    /// The agent gets no dependency outputs and the run's state is left
    /// untouched. Retries apply as usual; a task that keeps failing is
    /// reported in the result whatever its criticality.
    pub async fn replay_task(
        &self,
        run_id: &RunId,
        request: ReplayRequest,
    ) -> Result<ReplayReport, ServiceError> {
        request
            .validate()
            .map_err(|e| ServiceError::InvalidRequest(e.to_string()))?;
        let (snapshot, graph) = {
            let runs = self.runs.read().await;
            let entry = runs
                .get(run_id)
                .ok_or_else(|| ServiceError::NotFound(run_id.clone()))?;
            let state = entry.state.read().await;
            if state.status.is_active() {
                return Err(ServiceError::Conflict(format!(
                    "Run {run_id} is {}; only finished runs can replay a task",
                    state.status
                )));
            }
            (state.clone(), entry.graph.clone())
        };

        let task = replay_target(&graph, &request)?;
        let role = self.engine.team.role(&task.owning_role).ok_or_else(|| {
            ServiceError::InvalidRequest(format!("role '{}' is not defined", task.owning_role))
        })?;
        prepare_target_directory(&snapshot.target_directory).await?;

        let description = task.render_description(&snapshot.params());
        info!(run_id = %run_id, task_id = %task.id, "Replaying task");
        let outcome = self
            .engine
            .retry
            .execute(TaskRequest {
                task,
                description: &description,
                role,
                context: task_context(&snapshot, task, role),
                progress_percent: snapshot.progress_percent(graph.len()),
            })
            .await;

        let (result, error, attempts) = match outcome {
            Ok(done) => {
                let attempts = done.attempts.len() as u32;
                match done.output {
                    TaskOutput::Success { result } => (Some(result), None, attempts),
                    TaskOutput::SkippedAfterFailure { error } => (None, Some(error), attempts),
                }
            }
            Err(failure) => (None, Some(failure.error), failure.attempts),
        };

        let mut report = ReplayReport {
            run_id: run_id.clone(),
            task_id: task.id.clone(),
            task_name: task.name.clone(),
            role: role.id.clone(),
            description,
            succeeded: result.is_some(),
            result,
            error,
            attempts,
            timestamp: Utc::now(),
            saved_to: None,
        };
        if self.engine.write_results {
            match results::write_replay(&snapshot.target_directory, &report).await {
                Ok(path) => report.saved_to = Some(path),
                Err(e) => warn!(run_id = %run_id, error = %e, "Failed to write replay result"),
            }
        }
        Ok(report)
    }

    /// Subscribe to a run's progress, returning the current snapshot too.
    ///
    /// The subscription is registered before the snapshot is taken so no
    /// event published in between is lost.
    pub async fn subscribe(
        &self,
        run_id: &RunId,
    ) -> Result<(RunStatusView, Subscription), ServiceError> {
        let runs = self.runs.read().await;
        let entry = runs
            .get(run_id)
            .ok_or_else(|| ServiceError::NotFound(run_id.clone()))?;
        let subscription = self.engine.broadcast.subscribe(run_id);
        Ok((entry.view().await, subscription))
    }

    /// Wait until the run's coordinator has returned.
    pub async fn wait(&self, run_id: &RunId) -> Result<RunStatusView, ServiceError> {
        let done = {
            let runs = self.runs.read().await;
            runs.get(run_id)
                .ok_or_else(|| ServiceError::NotFound(run_id.clone()))?
                .done
                .clone()
        };
        done.cancelled().await;
        self.status(run_id).await
    }

    /// Number of runs per status.
    pub async fn run_counts(&self) -> HashMap<RunStatus, usize> {
        let runs = self.runs.read().await;
        let mut counts = HashMap::new();
        for entry in runs.values() {
            let status = entry.state.read().await.status;
            *counts.entry(status).or_insert(0) += 1;
        }
        counts
    }

    /// Drop finished runs older than the retention window from the
    /// registry. Returns how many were dropped.
    pub async fn evict_finished(&self) -> usize {
        let mut runs = self.runs.write().await;
        self.evict_expired(&mut runs).await
    }

    async fn evict_expired(&self, runs: &mut HashMap<RunId, RunEntry>) -> usize {
        let Ok(retention) = chrono::Duration::from_std(self.run_retention) else {
            return 0;
        };
        let now = Utc::now();
        let mut expired = Vec::new();
        for (run_id, entry) in runs.iter() {
            // The coordinator may still be publishing its final event.
            if !entry.done.is_cancelled() {
                continue;
            }
            let state = entry.state.read().await;
            if state.status.is_terminal() && now - state.updated_at >= retention {
                expired.push(run_id.clone());
            }
        }
        for run_id in &expired {
            runs.remove(run_id);
            debug!(run_id = %run_id, "Evicted finished run");
        }
        expired.len()
    }
}
