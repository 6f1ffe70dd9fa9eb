//! DevTeam orchestration server library.
//!
//! Drives a team's task graph run by run: dependency-ordered execution with
//! retries and backoff, a checkpoint after every task, and live progress
//! pushed to subscribers over SSE.

pub mod broadcast;
pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod http;
pub mod metrics;
pub mod results;
pub mod retry;
pub mod service;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;
pub use service::{RunService, ServiceError};
pub use state::AppState;
