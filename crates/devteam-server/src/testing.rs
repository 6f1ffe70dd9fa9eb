//! Test doubles shared by the server's unit tests.

use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use devteam_agent::{AgentContext, AgentError, TaskExecutor};
use devteam_core::{Criticality, Role, RunId, TaskConfig, TaskId, TeamConfig};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::broadcast::ProgressBroadcast;
use crate::checkpoint::CheckpointStore;
use crate::coordinator::Engine;
use crate::metrics::Metrics;
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::service::RunService;
use crate::state::AppState;

/// One recorded `execute_task` call.
#[derive(Debug, Clone)]
pub struct Call {
    pub context: AgentContext,
    pub description: String,
    pub at: Instant,
}

/// Holds the first call until released.
#[derive(Default)]
pub struct Gate {
    entered: CancellationToken,
    released: CancellationToken,
}

impl Gate {
    pub async fn entered(&self) {
        self.entered.cancelled().await;
    }

    pub fn release(&self) {
        self.released.cancel();
    }
}

/// Executor that replays scripted results and records every call.
///
/// Tasks listed as failing always return a transient error, and first
/// attempts in a flaky run fail once. Otherwise the script is consumed in
/// order and, once empty, every call succeeds with `"<task> done"`.
#[derive(Default)]
pub struct ScriptedExecutor {
    script: Mutex<VecDeque<Result<Value, AgentError>>>,
    failing: HashSet<TaskId>,
    flaky_runs: HashSet<RunId>,
    cancel_on_call: Mutex<Option<CancellationToken>>,
    gate: Mutex<Option<Arc<Gate>>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedExecutor {
    pub fn new(script: Vec<Result<Value, AgentError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        })
    }

    pub fn succeeding() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(tasks: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            failing: tasks.iter().map(|t| TaskId::from(*t)).collect(),
            ..Self::default()
        })
    }

    /// Every first attempt made for `run` fails transiently.
    pub fn flaky_run(run: &str) -> Arc<Self> {
        Arc::new(Self {
            flaky_runs: [RunId::new(run)].into_iter().collect(),
            ..Self::default()
        })
    }

    /// Cancel `token` as soon as the next call starts.
    pub fn cancel_on_call(&self, token: CancellationToken) {
        *self.cancel_on_call.lock().unwrap() = Some(token);
    }

    /// Block the next call until the returned gate is released.
    pub fn gate(&self) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().iter().map(|c| c.at).collect()
    }

    /// Task ids in call order, one entry per attempt.
    pub fn executed(&self) -> Vec<TaskId> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.context.task_id.clone())
            .collect()
    }
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn execute_task(
        &self,
        description: &str,
        _role: &Role,
        context: &AgentContext,
    ) -> Result<Value, AgentError> {
        self.calls.lock().unwrap().push(Call {
            context: context.clone(),
            description: description.to_string(),
            at: Instant::now(),
        });
        if let Some(token) = self.cancel_on_call.lock().unwrap().take() {
            token.cancel();
        }
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.entered.cancel();
            gate.released.cancelled().await;
        }

        if self.failing.contains(&context.task_id) {
            return Err(AgentError::Process(format!("{} is broken", context.task_id)));
        }
        if context.attempt == 1 && self.flaky_runs.contains(&context.run_id) {
            return Err(AgentError::Process(format!("{} flaked", context.task_id)));
        }
        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(Value::String(format!("{} done", context.task_id))))
    }
}

pub fn role() -> Role {
    Role {
        id: "dev".to_string(),
        title: "Developer".to_string(),
        goal: "Ship working code".to_string(),
        backstory: String::new(),
        tools: vec!["file_read".to_string(), "file_write".to_string()],
    }
}

/// A single-role team from `(id, depends_on, criticality)` triples.
pub fn team(tasks: &[(&str, &[&str], Criticality)]) -> TeamConfig {
    TeamConfig {
        tools: Vec::new(),
        roles: vec![Role {
            tools: Vec::new(),
            ..role()
        }],
        tasks: tasks
            .iter()
            .map(|(id, deps, criticality)| TaskConfig {
                id: id.to_string(),
                name: None,
                role: "dev".to_string(),
                description: format!("Do {id} for {{goal}}"),
                depends_on: deps.iter().map(|d| d.to_string()).collect(),
                criticality: *criticality,
            })
            .collect(),
    }
}

fn fast_retries() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(10))
}

pub fn engine(team: TeamConfig, executor: Arc<ScriptedExecutor>, dir: &Path) -> Engine {
    let broadcast = ProgressBroadcast::new();
    let metrics = Arc::new(Metrics::default());
    Engine {
        team: Arc::new(team),
        retry: RetryExecutor::new(executor, broadcast.clone(), metrics.clone(), fast_retries()),
        store: Arc::new(CheckpointStore::new(dir.join("checkpoints"), 3)),
        broadcast,
        metrics,
        write_results: false,
    }
}

pub fn service(team: TeamConfig, executor: Arc<ScriptedExecutor>, dir: &Path) -> RunService {
    RunService::new(
        team,
        executor,
        CheckpointStore::new(dir.join("checkpoints"), 3),
        fast_retries(),
    )
    .unwrap()
    .with_write_results(false)
}

/// App state over a temp dir with a three-task team that always succeeds.
pub fn test_state() -> (Arc<AppState>, tempfile::TempDir) {
    let dir = tempfile::TempDir::new().unwrap();
    let team = team(&[
        ("plan", &[], Criticality::Critical),
        ("build", &["plan"], Criticality::BestEffort),
        ("document", &["build"], Criticality::BestEffort),
    ]);
    let svc = service(team, ScriptedExecutor::succeeding(), dir.path());
    (AppState::new(svc), dir)
}
