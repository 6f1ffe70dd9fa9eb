//! Team definition: tools, roles and the tasks they own.
//!
//! A team is loaded once (usually from YAML) and validated by
//! [`TeamConfig::build_graph`]; every reference problem surfaces there as a
//! [`GraphIntegrityError`], never while a run is executing.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::GraphIntegrityError;
use crate::graph::{Criticality, TaskDefinition, TaskGraph};
use crate::run::ToolSelection;

/// A named capability roles may be granted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolConfig {
    pub id: String,
    #[serde(default)]
    pub description: String,
}

/// A category of work, executed by one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub backstory: String,
    #[serde(default)]
    pub tools: Vec<String>,
}

impl Role {
    /// Tools this role may use under the given selection.
    pub fn allowed_tools(&self, selection: &ToolSelection) -> Vec<String> {
        selection.filter(&self.tools)
    }
}

/// A task as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub role: String,
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub criticality: Criticality,
}

impl TaskConfig {
    fn to_definition(&self) -> TaskDefinition {
        let mut def = TaskDefinition::new(self.id.as_str(), self.role.as_str())
            .with_description(self.description.clone())
            .with_dependencies(self.depends_on.iter().map(String::as_str))
            .with_criticality(self.criticality);
        if let Some(name) = &self.name {
            def = def.with_name(name.clone());
        }
        def
    }
}

/// The whole team. Declaration order of `tasks` is the scheduling tie-break.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamConfig {
    #[serde(default)]
    pub tools: Vec<ToolConfig>,
    pub roles: Vec<Role>,
    pub tasks: Vec<TaskConfig>,
}

impl TeamConfig {
    /// Look up a role by id.
    pub fn role(&self, id: &str) -> Option<&Role> {
        self.roles.iter().find(|r| r.id == id)
    }

    /// Look up a tool by id.
    pub fn tool(&self, id: &str) -> Option<&ToolConfig> {
        self.tools.iter().find(|t| t.id == id)
    }

    /// Validate role and tool references, then build the task graph.
    pub fn build_graph(&self) -> Result<TaskGraph, GraphIntegrityError> {
        let tool_ids: HashSet<&str> = self.tools.iter().map(|t| t.id.as_str()).collect();

        let mut role_ids = HashSet::new();
        for role in &self.roles {
            if !role_ids.insert(role.id.as_str()) {
                return Err(GraphIntegrityError::DuplicateRole(role.id.clone()));
            }
            if let Some(tool) = role.tools.iter().find(|t| !tool_ids.contains(t.as_str())) {
                return Err(GraphIntegrityError::UnknownTool {
                    role: role.id.clone(),
                    tool: tool.clone(),
                });
            }
        }

        for task in &self.tasks {
            if !role_ids.contains(task.role.as_str()) {
                return Err(GraphIntegrityError::UnknownRole {
                    task: task.id.as_str().into(),
                    role: task.role.clone(),
                });
            }
        }

        TaskGraph::new(self.tasks.iter().map(TaskConfig::to_definition).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::TaskId;

    fn team() -> TeamConfig {
        TeamConfig {
            tools: vec![
                ToolConfig {
                    id: "CodeReviewTool".into(),
                    description: "Reviews code".into(),
                },
                ToolConfig {
                    id: "TestRunnerTool".into(),
                    description: "Runs tests".into(),
                },
            ],
            roles: vec![
                Role {
                    id: "project_manager".into(),
                    title: "Project Manager".into(),
                    goal: "Plan".into(),
                    backstory: String::new(),
                    tools: vec![],
                },
                Role {
                    id: "test_engineer".into(),
                    title: "Test Engineer".into(),
                    goal: "Test".into(),
                    backstory: String::new(),
                    tools: vec!["CodeReviewTool".into(), "TestRunnerTool".into()],
                },
            ],
            tasks: vec![
                TaskConfig {
                    id: "requirements_analysis".into(),
                    name: Some("Requirements Analysis".into()),
                    role: "project_manager".into(),
                    description: "Analyze {goal}".into(),
                    depends_on: vec![],
                    criticality: Criticality::Critical,
                },
                TaskConfig {
                    id: "code_review".into(),
                    name: None,
                    role: "test_engineer".into(),
                    description: "Review {target_directory}".into(),
                    depends_on: vec!["requirements_analysis".into()],
                    criticality: Criticality::BestEffort,
                },
            ],
        }
    }

    #[test]
    fn test_build_graph() {
        let graph = team().build_graph().unwrap();
        assert_eq!(graph.len(), 2);

        let first = graph.get(&TaskId::from("requirements_analysis")).unwrap();
        assert_eq!(first.name, "Requirements Analysis");
        assert!(first.is_critical());

        let review = graph.get(&TaskId::from("code_review")).unwrap();
        assert_eq!(review.name, "code_review");
        assert_eq!(review.owning_role, "test_engineer");
    }

    #[test]
    fn test_unknown_role_is_rejected() {
        let mut team = team();
        team.tasks[1].role = "designer".into();
        assert_eq!(
            team.build_graph().unwrap_err(),
            GraphIntegrityError::UnknownRole {
                task: "code_review".into(),
                role: "designer".into(),
            }
        );
    }

    #[test]
    fn test_unknown_tool_is_rejected() {
        let mut team = team();
        team.roles[0].tools.push("MagicTool".into());
        assert!(matches!(
            team.build_graph().unwrap_err(),
            GraphIntegrityError::UnknownTool { tool, .. } if tool == "MagicTool"
        ));
    }

    #[test]
    fn test_duplicate_role_is_rejected() {
        let mut team = team();
        let dup = team.roles[0].clone();
        team.roles.push(dup);
        assert_eq!(
            team.build_graph().unwrap_err(),
            GraphIntegrityError::DuplicateRole("project_manager".into())
        );
    }

    #[test]
    fn test_dependency_errors_surface_from_graph() {
        let mut team = team();
        team.tasks[0].depends_on.push("code_review".into());
        assert!(matches!(
            team.build_graph().unwrap_err(),
            GraphIntegrityError::Cycle { .. }
        ));
    }

    #[test]
    fn test_role_tool_selection() {
        let team = team();
        let role = team.role("test_engineer").unwrap();
        let only_review = ToolSelection::from("CodeReviewTool".to_string());
        assert_eq!(role.allowed_tools(&only_review), vec!["CodeReviewTool".to_string()]);
        assert_eq!(role.allowed_tools(&ToolSelection::All).len(), 2);
        assert!(team.tool("TestRunnerTool").is_some());
    }
}
