//! Core domain errors.

use thiserror::Error;

use crate::ids::TaskId;

/// Core domain errors for DevTeam.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The task graph or team definition is invalid.
    #[error(transparent)]
    Graph(#[from] GraphIntegrityError),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Structural problems in a task graph or the team definition it is built from.
///
/// These are detected once, when the graph is constructed, and never mid-run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphIntegrityError {
    /// Dependencies form a cycle. The path starts and ends on the same task.
    #[error("Dependency cycle detected: {}", join_ids(.cycle))]
    Cycle { cycle: Vec<TaskId> },

    /// A task depends on an id that is not part of the graph.
    #[error("Task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    /// Two tasks share the same id.
    #[error("Duplicate task id: {0}")]
    DuplicateTask(TaskId),

    /// A task is owned by a role the team does not define.
    #[error("Task '{task}' is assigned to unknown role '{role}'")]
    UnknownRole { task: TaskId, role: String },

    /// Two roles share the same id.
    #[error("Duplicate role id: {0}")]
    DuplicateRole(String),

    /// A role lists a tool the team does not define.
    #[error("Role '{role}' references unknown tool '{tool}'")]
    UnknownTool { role: String, tool: String },

    /// The graph has no tasks at all.
    #[error("Task graph is empty")]
    Empty,
}

fn join_ids(ids: &[TaskId]) -> String {
    ids.iter()
        .map(TaskId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_names_path() {
        let err = GraphIntegrityError::Cycle {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Dependency cycle detected: a -> b -> a");
    }

    #[test]
    fn test_graph_error_converts_to_core_error() {
        let err: CoreError = GraphIntegrityError::Empty.into();
        assert!(matches!(err, CoreError::Graph(GraphIntegrityError::Empty)));
        assert_eq!(err.to_string(), "Task graph is empty");
    }
}
