//! Task executors for DevTeam.
//!
//! The orchestration core only sees the [`TaskExecutor`] trait: given a
//! rendered task description, the owning role and an [`AgentContext`], return
//! an opaque JSON result or an [`AgentError`]. [`ClaudeExecutor`] implements
//! it by running the Claude Code CLI as a subprocess.
//!
//! # Example
//!
//! ```rust,no_run
//! use devteam_agent::{AgentContext, ClaudeExecutor, PermissionMode, TaskExecutor};
//! use devteam_core::{Role, RunId};
//!
//! async fn run(role: &Role) -> Result<(), Box<dyn std::error::Error>> {
//!     let executor = ClaudeExecutor::new("claude")
//!         .with_permission_mode(PermissionMode::AcceptEdits);
//!
//!     let ctx = AgentContext::new(RunId::generate(), "requirements_analysis".into(), ".");
//!     let result = executor.execute_task("Write a backlog", role, &ctx).await?;
//!     println!("{result}");
//!     Ok(())
//! }
//! ```

mod claude;
mod error;
mod executor;
mod types;

pub use claude::{ClaudeExecutor, ExecutionResult};
pub use error::AgentError;
pub use executor::{AgentContext, TaskExecutor};
pub use types::{AssistantMessage, ClaudeMessage, ContentItem, PermissionMode};
