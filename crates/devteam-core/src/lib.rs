//! DevTeam Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network/HTTP
//! - Filesystem persistence
//! - Runtime specifics
//!
//! Everything the orchestration server and the CLI agree on lives here:
//! the task graph, run state, progress events and the team definition.

pub mod error;
pub mod event;
pub mod graph;
pub mod ids;
pub mod run;
pub mod status;
pub mod team;

// Re-export commonly used types
pub use error::{CoreError, GraphIntegrityError};
pub use event::ProgressEvent;
pub use graph::{Criticality, TaskDefinition, TaskGraph};
pub use ids::{RunId, TaskId};
pub use run::{
    FailureReason, ProcessOptions, ReplayReport, ReplayRequest, RunAccepted, RunFailure,
    RunRequest, RunState, RunStatusView, TaskOutput, ToolSelection,
};
pub use status::RunStatus;
pub use team::{Role, TaskConfig, TeamConfig, ToolConfig};
