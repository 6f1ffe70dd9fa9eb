//! Shared application state.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::service::RunService;

/// Shared application state.
pub struct AppState {
    /// Run registry and lifecycle operations.
    pub service: Arc<RunService>,

    /// When this server process started.
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Create a new AppState wrapped in Arc.
    pub fn new(service: RunService) -> Arc<Self> {
        Arc::new(Self {
            service: Arc::new(service),
            started_at: Utc::now(),
        })
    }
}
