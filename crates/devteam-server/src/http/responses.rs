//! HTTP request and response types.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use devteam_core::{Criticality, Role, TaskGraph, TaskId, TeamConfig};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::service::ServiceError;

// ============================================================================
// Error types
// ============================================================================

/// Error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// A [`ServiceError`] on its way out as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub ServiceError);

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Conflict(_) => StatusCode::CONFLICT,
            ServiceError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::Graph(_) | ServiceError::Checkpoint(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        }
        let body = ErrorResponse {
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

// ============================================================================
// Run types
// ============================================================================

/// Request body for the feedback endpoint.
#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    pub feedback: String,
}

// ============================================================================
// Team types
// ============================================================================

/// A task as seen by clients.
#[derive(Debug, Serialize)]
pub struct TaskResponse {
    pub id: TaskId,
    pub name: String,
    pub role: String,
    pub depends_on: Vec<TaskId>,
    pub criticality: Criticality,
}

/// Response body for the team endpoint.
#[derive(Debug, Serialize)]
pub struct TeamResponse {
    pub roles: Vec<Role>,
    /// Tasks in declaration order.
    pub tasks: Vec<TaskResponse>,
    /// Resolved execution order.
    pub task_order: Vec<TaskId>,
}

impl TeamResponse {
    pub fn new(team: &TeamConfig, graph: &TaskGraph) -> Self {
        Self {
            roles: team.roles.clone(),
            tasks: graph
                .tasks()
                .iter()
                .map(|t| TaskResponse {
                    id: t.id.clone(),
                    name: t.name.clone(),
                    role: t.owning_role.clone(),
                    depends_on: t.dependency_ids.clone(),
                    criticality: t.criticality,
                })
                .collect(),
            task_order: graph.resolve_order().to_vec(),
        }
    }
}
