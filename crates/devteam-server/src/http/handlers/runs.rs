//! Run lifecycle handlers.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use devteam_core::{
    ReplayReport, ReplayRequest, RunAccepted, RunId, RunRequest, RunStatusView, TaskId, TaskOutput,
};
use tracing::info;

use crate::http::responses::{ApiError, FeedbackRequest, TeamResponse};
use crate::service::ServiceError;
use crate::state::AppState;

fn invalid_body(rejection: JsonRejection) -> ApiError {
    ApiError(ServiceError::InvalidRequest(rejection.body_text()))
}

/// Start a run (or resume one from its checkpoint).
pub async fn create_run(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RunRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<RunAccepted>), ApiError> {
    let Json(request) = payload.map_err(invalid_body)?;
    info!(
        goal = %request.goal,
        target_directory = %request.target_directory.display(),
        resume = request.resume,
        "Run requested"
    );
    let accepted = state.service.start_run(request).await?;
    Ok((StatusCode::CREATED, Json(accepted)))
}

pub async fn list_runs(State(state): State<Arc<AppState>>) -> Json<Vec<RunStatusView>> {
    Json(state.service.list_runs().await)
}

/// Pull-based status query.
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<Json<RunStatusView>, ApiError> {
    let view = state.service.status(&RunId::new(run_id)).await?;
    Ok(Json(view))
}

pub async fn get_outputs(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<Json<BTreeMap<TaskId, TaskOutput>>, ApiError> {
    let outputs = state.service.outputs(&RunId::new(run_id)).await?;
    Ok(Json(outputs))
}

/// Request cancellation; the run stops before its next task.
pub async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<(StatusCode, Json<RunStatusView>), ApiError> {
    let view = state.service.cancel(&RunId::new(run_id)).await?;
    Ok((StatusCode::ACCEPTED, Json(view)))
}

/// Start the next sprint of a completed run.
pub async fn submit_feedback(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    payload: Result<Json<FeedbackRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<RunAccepted>), ApiError> {
    let Json(body) = payload.map_err(invalid_body)?;
    let accepted = state
        .service
        .submit_feedback(&RunId::new(run_id), body.feedback)
        .await?;
    Ok((StatusCode::CREATED, Json(accepted)))
}

/// Re-execute a single task of a finished run. Answers once the task is done.
pub async fn replay_task(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    payload: Result<Json<ReplayRequest>, JsonRejection>,
) -> Result<Json<ReplayReport>, ApiError> {
    let Json(request) = payload.map_err(invalid_body)?;
    let report = state
        .service
        .replay_task(&RunId::new(run_id), request)
        .await?;
    Ok(Json(report))
}

/// Roles and resolved task order.
pub async fn get_team(State(state): State<Arc<AppState>>) -> Json<TeamResponse> {
    Json(TeamResponse::new(state.service.team(), state.service.graph()))
}
