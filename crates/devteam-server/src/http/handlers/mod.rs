//! HTTP request handlers.

mod events;
mod health;
mod runs;

pub use events::run_events;
pub use health::{health_check, metrics_handler};
pub use runs::{
    cancel_run, create_run, get_outputs, get_run, get_team, list_runs, replay_task, submit_feedback,
};
