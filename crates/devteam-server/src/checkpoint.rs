//! Durable per-run checkpoints.
//!
//! One JSON file per run (`<run_id>.json`), rewritten after every task
//! completion. The previous version is copied to
//! `<run_id>.<timestamp>.bak.json` first and only the newest backups are
//! kept. Writes go through a temp file and a rename so a crash never leaves a
//! half-written checkpoint behind.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use devteam_core::{RunFailure, RunId, RunState, RunStatus, TaskGraph, TaskId, TaskOutput};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from the checkpoint store.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Run id '{0}' cannot be used as a checkpoint name")]
    InvalidRunId(RunId),

    #[error("Checkpoint I/O error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Checkpoint serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CheckpointError + '_ {
    move |source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// On-disk snapshot of a run's progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: RunId,
    pub sprint_number: u32,
    pub timestamp: DateTime<Utc>,
    pub completed_task_ids: Vec<TaskId>,
    /// Result text per task; for skipped tasks, the last error.
    pub task_outputs: BTreeMap<TaskId, String>,
    #[serde(default)]
    pub skipped_task_ids: Vec<TaskId>,
    /// Run status when the checkpoint was written.
    #[serde(default)]
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
}

impl Checkpoint {
    pub fn from_state(state: &RunState) -> Self {
        Self {
            run_id: state.run_id.clone(),
            sprint_number: state.sprint_number,
            timestamp: Utc::now(),
            completed_task_ids: state.completed_task_ids.clone(),
            task_outputs: state
                .task_outputs
                .iter()
                .map(|(id, output)| (id.clone(), output.text().to_string()))
                .collect(),
            skipped_task_ids: state.skipped_task_ids(),
            status: state.status,
            failure: state.failure.clone(),
        }
    }

    /// Returns true if the run had ended in `failed`. Such a run can only be
    /// continued as a new run seeded from this checkpoint.
    pub fn is_failed(&self) -> bool {
        self.status == RunStatus::Failed
    }

    /// Keep only the longest prefix of completed tasks that is consistent
    /// with `graph`; drop outputs that fall outside it.
    pub fn reconcile(mut self, graph: &TaskGraph) -> Self {
        let keep = graph.consistent_prefix_len(&self.completed_task_ids);
        if keep < self.completed_task_ids.len() {
            let dropped: Vec<&str> = self.completed_task_ids[keep..]
                .iter()
                .map(TaskId::as_str)
                .collect();
            warn!(
                run_id = %self.run_id,
                kept = keep,
                dropped = ?dropped,
                "Checkpoint does not match the task graph; discarding inconsistent tail"
            );
            self.completed_task_ids.truncate(keep);
        }

        let kept = &self.completed_task_ids;
        self.task_outputs.retain(|id, _| kept.contains(id));
        self.skipped_task_ids.retain(|id| kept.contains(id));
        self
    }

    /// Preload completed tasks into a fresh run state.
    pub fn apply_to(&self, state: &mut RunState) {
        for task_id in &self.completed_task_ids {
            let text = self.task_outputs.get(task_id).cloned().unwrap_or_default();
            let output = if self.skipped_task_ids.contains(task_id) {
                TaskOutput::SkippedAfterFailure { error: text }
            } else {
                TaskOutput::Success { result: text }
            };
            state.record_output(task_id.clone(), output);
        }
    }
}

/// Filesystem-backed checkpoint store.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    max_backups: usize,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, max_backups: usize) -> Self {
        Self {
            dir: dir.into(),
            max_backups,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the live checkpoint for `run_id`.
    pub fn path_for(&self, run_id: &RunId) -> Result<PathBuf, CheckpointError> {
        if !run_id.is_path_safe() {
            return Err(CheckpointError::InvalidRunId(run_id.clone()));
        }
        Ok(self.dir.join(format!("{run_id}.json")))
    }

    /// Persist the run's progress.
    ///
    /// Backup and pruning failures are logged and do not fail the save.
    pub async fn save(&self, state: &RunState) -> Result<(), CheckpointError> {
        let path = self.path_for(&state.run_id)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(io_error(&self.dir))?;

        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let backup = self.backup_path(&state.run_id);
            if let Err(e) = tokio::fs::copy(&path, &backup).await {
                warn!(run_id = %state.run_id, error = %e, "Failed to back up checkpoint");
            }
        }

        let checkpoint = Checkpoint::from_state(state);
        let body = serde_json::to_vec_pretty(&checkpoint)?;
        let tmp = self.dir.join(format!("{}.json.tmp", state.run_id));
        tokio::fs::write(&tmp, &body).await.map_err(io_error(&tmp))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(io_error(&path))?;

        debug!(
            run_id = %state.run_id,
            completed = checkpoint.completed_task_ids.len(),
            "Checkpoint saved"
        );

        if let Err(e) = self.prune_backups(&state.run_id).await {
            warn!(run_id = %state.run_id, error = %e, "Failed to prune checkpoint backups");
        }
        Ok(())
    }

    /// Load the checkpoint for `run_id`, if one exists.
    pub async fn load(&self, run_id: &RunId) -> Result<Option<Checkpoint>, CheckpointError> {
        let path = self.path_for(run_id)?;
        let body = match tokio::fs::read(&path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&path)(e)),
        };
        Ok(Some(serde_json::from_slice(&body)?))
    }

    /// Returns true if a checkpoint exists for `run_id`.
    pub async fn exists(&self, run_id: &RunId) -> Result<bool, CheckpointError> {
        let path = self.path_for(run_id)?;
        Ok(tokio::fs::try_exists(&path).await.unwrap_or(false))
    }

    /// Backup files for `run_id`, oldest first.
    pub async fn backups(&self, run_id: &RunId) -> Result<Vec<PathBuf>, CheckpointError> {
        self.path_for(run_id)?;
        let prefix = format!("{run_id}.");
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&self.dir)(e)),
        };

        let mut backups = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_error(&self.dir))? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(&prefix) && name.ends_with(".bak.json") {
                backups.push(entry.path());
            }
        }
        // Timestamps are fixed-width, so name order is age order.
        backups.sort();
        Ok(backups)
    }

    fn backup_path(&self, run_id: &RunId) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%6fZ");
        self.dir.join(format!("{run_id}.{stamp}.bak.json"))
    }

    async fn prune_backups(&self, run_id: &RunId) -> Result<(), CheckpointError> {
        let backups = self.backups(run_id).await?;
        let excess = backups.len().saturating_sub(self.max_backups);
        for path in &backups[..excess] {
            tokio::fs::remove_file(path).await.map_err(io_error(path))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devteam_core::TaskDefinition;
    use tempfile::TempDir;

    fn state_with(run: &str, done: &[(&str, TaskOutput)]) -> RunState {
        let mut state = RunState::new(RunId::new(run), "goal", "/tmp/project");
        for (id, output) in done {
            state.record_output((*id).into(), output.clone());
        }
        state
    }

    fn ok(text: &str) -> TaskOutput {
        TaskOutput::Success {
            result: text.to_string(),
        }
    }

    #[tokio::test]
    async fn test_round_trip_preserves_order_and_outputs() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path(), 5);
        let state = state_with(
            "run-1",
            &[
                ("C", ok("declared last, finished first")),
                ("A", ok("{\"files\":2}")),
                ("B", TaskOutput::SkippedAfterFailure { error: "boom".into() }),
            ],
        );

        store.save(&state).await.unwrap();
        let loaded = store.load(&state.run_id).await.unwrap().unwrap();

        assert_eq!(loaded.completed_task_ids, state.completed_task_ids);
        assert_eq!(loaded.skipped_task_ids, vec![TaskId::from("B")]);

        let mut restored = RunState::new(RunId::new("run-1"), "goal", "/tmp/project");
        loaded.apply_to(&mut restored);
        assert_eq!(restored.completed_task_ids, state.completed_task_ids);
        assert_eq!(restored.task_outputs, state.task_outputs);
    }

    #[tokio::test]
    async fn test_failed_status_is_persisted() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path(), 5);
        let mut state = state_with("run-f", &[("A", ok("a"))]);
        state.mark_failed(RunFailure::critical_task("B".into(), "Build", "exit 1"));

        store.save(&state).await.unwrap();
        let loaded = store.load(&state.run_id).await.unwrap().unwrap();
        assert!(loaded.is_failed());
        assert_eq!(loaded.failure, state.failure);

        // Files written before status was recorded load as non-failed.
        let legacy = r#"{"run_id":"old","sprint_number":1,"timestamp":"2024-01-01T00:00:00Z","completed_task_ids":[],"task_outputs":{}}"#;
        let old: Checkpoint = serde_json::from_str(legacy).unwrap();
        assert!(!old.is_failed());
        assert!(old.failure.is_none());
    }

    #[tokio::test]
    async fn test_load_missing_returns_none() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("not-yet-created"), 5);
        assert!(store.load(&RunId::new("nope")).await.unwrap().is_none());
        assert!(!store.exists(&RunId::new("nope")).await.unwrap());
    }

    #[tokio::test]
    async fn test_rejects_unsafe_run_ids() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path(), 5);
        let state = state_with("../escape", &[]);
        assert!(matches!(
            store.save(&state).await.unwrap_err(),
            CheckpointError::InvalidRunId(_)
        ));
    }

    #[tokio::test]
    async fn test_backups_are_kept_and_pruned() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path(), 2);
        let mut state = state_with("run-2", &[]);

        for task in ["A", "B", "C", "D", "E"] {
            state.record_output(task.into(), ok(task));
            store.save(&state).await.unwrap();
            // Distinct backup timestamps.
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let backups = store.backups(&state.run_id).await.unwrap();
        assert_eq!(backups.len(), 2);

        // The newest backup is the version before the last save.
        let newest: Checkpoint =
            serde_json::from_slice(&std::fs::read(backups.last().unwrap()).unwrap()).unwrap();
        assert_eq!(newest.completed_task_ids.len(), 4);

        let live = store.load(&state.run_id).await.unwrap().unwrap();
        assert_eq!(live.completed_task_ids.len(), 5);
        assert!(!dir.path().join("run-2.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_backups_of_other_runs_are_untouched() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path(), 1);
        let mut a = state_with("a", &[]);
        let mut ab = state_with("a_b", &[]);
        for task in ["X", "Y", "Z"] {
            a.record_output(task.into(), ok(task));
            ab.record_output(task.into(), ok(task));
            store.save(&a).await.unwrap();
            store.save(&ab).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        assert_eq!(store.backups(&a.run_id).await.unwrap().len(), 1);
        assert_eq!(store.backups(&ab.run_id).await.unwrap().len(), 1);
    }

    #[test]
    fn test_reconcile_keeps_consistent_prefix() {
        let graph = TaskGraph::new(vec![
            TaskDefinition::new("A", "r"),
            TaskDefinition::new("B", "r").with_dependencies(["A"]),
            TaskDefinition::new("C", "r").with_dependencies(["B"]),
        ])
        .unwrap();

        let checkpoint = Checkpoint {
            run_id: RunId::new("r"),
            sprint_number: 1,
            timestamp: Utc::now(),
            completed_task_ids: vec!["A".into(), "C".into(), "B".into()],
            task_outputs: [("A", "a"), ("B", "b"), ("C", "c")]
                .into_iter()
                .map(|(k, v)| (TaskId::from(k), v.to_string()))
                .collect(),
            skipped_task_ids: vec!["C".into()],
            status: RunStatus::Running,
            failure: None,
        };

        let reconciled = checkpoint.reconcile(&graph);
        assert_eq!(reconciled.completed_task_ids, vec![TaskId::from("A")]);
        assert_eq!(reconciled.task_outputs.len(), 1);
        assert!(reconciled.skipped_task_ids.is_empty());
    }
}
