//! Server configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use devteam_agent::PermissionMode;
use devteam_core::{GraphIntegrityError, TeamConfig};
use thiserror::Error;

use crate::retry::RetryPolicy;

/// Team definition compiled into the binary.
pub const DEFAULT_TEAM_YAML: &str = include_str!("../config/team.yaml");

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Server configuration.
#[derive(Debug, Clone, Parser)]
#[command(name = "devteam-server", version, about = "DevTeam orchestration server")]
pub struct Config {
    /// HTTP bind address.
    #[arg(long, env = "DEVTEAM_HTTP_ADDR", default_value = "127.0.0.1:8000")]
    pub http_addr: SocketAddr,

    /// Directory holding run checkpoints.
    #[arg(long, env = "DEVTEAM_CHECKPOINT_DIR", default_value = ".devteam/checkpoints")]
    pub checkpoint_dir: PathBuf,

    /// Team definition (YAML). Defaults to the built-in dev team.
    #[arg(long, env = "DEVTEAM_TEAM_CONFIG")]
    pub team_config: Option<PathBuf>,

    /// Path to the Claude CLI.
    #[arg(long, env = "DEVTEAM_CLAUDE_PATH", default_value = "claude")]
    pub claude_path: String,

    /// Model passed to the Claude CLI.
    #[arg(long, env = "DEVTEAM_MODEL")]
    pub model: Option<String>,

    /// Claude permission mode (default, acceptEdits, plan, bypassPermissions).
    #[arg(long, env = "DEVTEAM_PERMISSION_MODE", default_value = "acceptEdits")]
    pub permission_mode: PermissionMode,

    /// Retries after the first failed attempt of a task.
    #[arg(long, env = "DEVTEAM_MAX_RETRIES", default_value_t = 3)]
    pub max_retries: u32,

    /// Backoff before retry n is `unit * 2^n`.
    #[arg(long, env = "DEVTEAM_BACKOFF_UNIT_MS", default_value_t = 1000)]
    pub backoff_unit_ms: u64,

    /// Wall-clock limit for one task attempt.
    #[arg(long, env = "DEVTEAM_TASK_TIMEOUT_SECS")]
    pub task_timeout_secs: Option<u64>,

    /// Checkpoint backups kept per run.
    #[arg(long, env = "DEVTEAM_CHECKPOINT_BACKUPS", default_value_t = 5)]
    pub checkpoint_backups: usize,

    /// How long a finished run stays queryable before it is dropped from
    /// memory. Its checkpoint is kept.
    #[arg(long, env = "DEVTEAM_RUN_RETENTION_SECS", default_value_t = 3600)]
    pub run_retention_secs: u64,

    /// Do not write sprint results into the target directory.
    #[arg(long, env = "DEVTEAM_NO_WRITE_RESULTS")]
    pub no_write_results: bool,

    #[arg(long, env = "DEVTEAM_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl Config {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.backoff_unit_ms))
    }

    pub fn run_retention(&self) -> Duration {
        Duration::from_secs(self.run_retention_secs)
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_secs.map(Duration::from_secs)
    }

    /// Load and validate the configured team.
    pub fn load_team(&self) -> Result<TeamConfig, ConfigError> {
        match &self.team_config {
            Some(path) => load_team_file(path),
            None => parse_team(DEFAULT_TEAM_YAML),
        }
    }
}

/// Errors loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read team config '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid team config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid team config: {0}")]
    Graph(#[from] GraphIntegrityError),
}

/// Read a team definition from disk and validate it.
pub fn load_team_file(path: &Path) -> Result<TeamConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_team(&raw)
}

/// Parse a team definition and check it builds a valid graph.
pub fn parse_team(yaml: &str) -> Result<TeamConfig, ConfigError> {
    let team: TeamConfig = serde_yaml::from_str(yaml)?;
    team.build_graph()?;
    Ok(team)
}

#[cfg(test)]
mod tests {
    use super::*;
    use devteam_core::TaskId;

    #[test]
    fn test_defaults() {
        let config = Config::parse_from(["devteam-server"]);
        assert_eq!(config.http_addr, "127.0.0.1:8000".parse().unwrap());
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.checkpoint_backups, 5);
        assert_eq!(config.permission_mode, PermissionMode::AcceptEdits);
        assert!(!config.no_write_results);
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.run_retention(), Duration::from_secs(3600));

        let policy = config.retry_policy();
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
    }

    #[test]
    fn test_flags_override_defaults() {
        let config = Config::parse_from([
            "devteam-server",
            "--max-retries",
            "1",
            "--backoff-unit-ms",
            "10",
            "--no-write-results",
            "--log-format",
            "json",
            "--task-timeout-secs",
            "60",
        ]);
        assert_eq!(config.max_retries, 1);
        assert!(config.no_write_results);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.task_timeout(), Some(Duration::from_secs(60)));
        assert_eq!(config.retry_policy().backoff(2), Duration::from_millis(40));
    }

    #[test]
    fn test_default_team_is_valid() {
        let team = parse_team(DEFAULT_TEAM_YAML).unwrap();
        assert_eq!(team.roles.len(), 4);
        assert_eq!(team.tasks.len(), 11);

        let graph = team.build_graph().unwrap();
        let critical: Vec<&str> = graph
            .tasks()
            .iter()
            .filter(|t| t.is_critical())
            .map(|t| t.id.as_str())
            .collect();
        assert_eq!(critical, vec!["requirements_analysis", "architecture_design"]);

        let order: Vec<&str> = graph.resolve_order().iter().map(TaskId::as_str).collect();
        assert_eq!(
            order,
            vec![
                "requirements_analysis",
                "architecture_design",
                "codebase_analysis",
                "sprint_planning",
                "feature_implementation",
                "test_development",
                "code_review",
                "code_refactoring",
                "code_cleanup",
                "documentation_update",
                "sprint_retrospective",
            ]
        );
    }

    #[test]
    fn test_invalid_team_is_rejected() {
        let yaml = r#"
roles:
  - id: dev
    title: Developer
tasks:
  - id: a
    role: dev
    description: A
    depends_on: [b]
  - id: b
    role: dev
    description: B
    depends_on: [a]
"#;
        assert!(matches!(
            parse_team(yaml).unwrap_err(),
            ConfigError::Graph(GraphIntegrityError::Cycle { .. })
        ));

        let unknown_role = "roles: []\ntasks:\n  - id: a\n    role: ghost\n    description: A\n";
        assert!(matches!(
            parse_team(unknown_role).unwrap_err(),
            ConfigError::Graph(GraphIntegrityError::UnknownRole { .. })
        ));
    }

    #[test]
    fn test_missing_team_file() {
        let err = load_team_file(Path::new("/nonexistent/team.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
