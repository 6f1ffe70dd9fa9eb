//! Sprint results written into the project directory.
//!
//! Layout: `<target>/results/sprint_<n>/<task_id>.json` per task plus
//! `sprint_summary.json`; single-task replays go to
//! `<target>/results/replays/<task_id>_<timestamp>.json`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use devteam_core::{ReplayReport, RunId, RunState, RunStatus, TaskGraph, TaskId, TaskOutput};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ResultsError {
    #[error("Failed to write '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode results: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Serialize)]
struct TaskResultFile<'a> {
    task_id: &'a TaskId,
    name: &'a str,
    role: &'a str,
    outcome: &'static str,
    result: &'a str,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct SprintSummary<'a> {
    run_id: &'a RunId,
    sprint: u32,
    goal: &'a str,
    target_directory: &'a Path,
    tasks: &'a [TaskId],
    skipped: Vec<TaskId>,
    completed: bool,
    timestamp: DateTime<Utc>,
}

/// Directory the results of `state`'s sprint go to.
pub fn sprint_dir(state: &RunState) -> PathBuf {
    state
        .target_directory
        .join("results")
        .join(format!("sprint_{}", state.sprint_number))
}

async fn write_json(path: PathBuf, value: &impl Serialize) -> Result<(), ResultsError> {
    let body = serde_json::to_vec_pretty(value)?;
    tokio::fs::write(&path, body)
        .await
        .map_err(|source| ResultsError::Io { path, source })
}

/// Write one file per finished task and the sprint summary.
pub async fn write_sprint_results(
    state: &RunState,
    graph: &TaskGraph,
) -> Result<PathBuf, ResultsError> {
    let dir = sprint_dir(state);
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|source| ResultsError::Io {
            path: dir.clone(),
            source,
        })?;

    let now = Utc::now();
    for task_id in &state.completed_task_ids {
        let Some(output) = state.task_outputs.get(task_id) else {
            continue;
        };
        let (name, role) = graph
            .get(task_id)
            .map(|t| (t.name.as_str(), t.owning_role.as_str()))
            .unwrap_or((task_id.as_str(), ""));
        let outcome = match output {
            TaskOutput::Success { .. } => "success",
            TaskOutput::SkippedAfterFailure { .. } => "skipped_after_failure",
        };
        let file = TaskResultFile {
            task_id,
            name,
            role,
            outcome,
            result: output.text(),
            timestamp: now,
        };
        write_json(dir.join(format!("{task_id}.json")), &file).await?;
    }

    let summary = SprintSummary {
        run_id: &state.run_id,
        sprint: state.sprint_number,
        goal: &state.goal,
        target_directory: &state.target_directory,
        tasks: &state.completed_task_ids,
        skipped: state.skipped_task_ids(),
        completed: state.status == RunStatus::Completed,
        timestamp: now,
    };
    write_json(dir.join("sprint_summary.json"), &summary).await?;

    info!(
        run_id = %state.run_id,
        sprint = state.sprint_number,
        dir = %dir.display(),
        "Sprint results written"
    );
    Ok(dir)
}

/// Write a replay report, returning the file it went to.
pub async fn write_replay(
    target_directory: &Path,
    report: &ReplayReport,
) -> Result<PathBuf, ResultsError> {
    let dir = target_directory.join("results").join("replays");
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|source| ResultsError::Io {
            path: dir.clone(),
            source,
        })?;

    let stamp = report.timestamp.format("%Y%m%d_%H%M%S%3f");
    let path = dir.join(format!("{}_{stamp}.json", report.task_id));
    write_json(path.clone(), report).await?;
    info!(
        run_id = %report.run_id,
        task_id = %report.task_id,
        path = %path.display(),
        "Replay result written"
    );
    Ok(path)
}
