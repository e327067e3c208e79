use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::Deserialize;
use uuid::Uuid;

use bv_common::model::{ComparisonResult, LevelingConfig};
use bv_common::pipeline::{
    AnalysisStarted, BreakdownSelection, ExtractTextReport, LevelingOutcome, ProjectStatusView,
    ReviewQueueEntry,
};

use crate::SharedState;
use crate::auth::AuthUser;
use crate::error::ApiError;

pub async fn extract_text(
    State(state): State<SharedState>,
    Path(project_id): Path<Uuid>,
    auth: AuthUser,
) -> Result<Json<ExtractTextReport>, ApiError> {
    let report = state.pipeline.extract_text(auth.user_id, project_id).await?;
    Ok(Json(report))
}

/// Answers as soon as the run is submitted; the run itself outlives the
/// request and reports through the project status.
pub async fn analyze(
    State(state): State<SharedState>,
    Path(project_id): Path<Uuid>,
    auth: AuthUser,
) -> Result<(StatusCode, Json<AnalysisStarted>), ApiError> {
    let run = state.pipeline.analyze(auth.user_id, project_id).await?;
    Ok((StatusCode::ACCEPTED, Json(run.started())))
}

pub async fn status(
    State(state): State<SharedState>,
    Path(project_id): Path<Uuid>,
    auth: AuthUser,
) -> Result<Json<ProjectStatusView>, ApiError> {
    Ok(Json(
        state.pipeline.project_status(auth.user_id, project_id).await?,
    ))
}

pub async fn comparison(
    State(state): State<SharedState>,
    Path(project_id): Path<Uuid>,
    auth: AuthUser,
) -> Result<Json<ComparisonResult>, ApiError> {
    Ok(Json(state.pipeline.comparison(auth.user_id, project_id).await?))
}

pub async fn get_leveling(
    State(state): State<SharedState>,
    Path(project_id): Path<Uuid>,
    auth: AuthUser,
) -> Result<Json<Option<LevelingConfig>>, ApiError> {
    Ok(Json(
        state.pipeline.get_leveling(auth.user_id, project_id).await?,
    ))
}

pub async fn set_leveling(
    State(state): State<SharedState>,
    Path(project_id): Path<Uuid>,
    auth: AuthUser,
    Json(config): Json<LevelingConfig>,
) -> Result<Json<LevelingOutcome>, ApiError> {
    let outcome = state
        .pipeline
        .set_leveling(auth.user_id, project_id, config)
        .await?;
    Ok(Json(outcome))
}

pub async fn clear_leveling(
    State(state): State<SharedState>,
    Path(project_id): Path<Uuid>,
    auth: AuthUser,
) -> Result<StatusCode, ApiError> {
    state
        .pipeline
        .clear_leveling(auth.user_id, project_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn review_queue(
    State(state): State<SharedState>,
    Path(project_id): Path<Uuid>,
    auth: AuthUser,
) -> Result<Json<Vec<ReviewQueueEntry>>, ApiError> {
    Ok(Json(
        state.pipeline.review_queue(auth.user_id, project_id).await?,
    ))
}

#[derive(Debug, Deserialize)]
pub struct SelectBreakdownRequest {
    pub template_id: Uuid,
}

pub async fn select_breakdown(
    State(state): State<SharedState>,
    Path(project_id): Path<Uuid>,
    auth: AuthUser,
    Json(request): Json<SelectBreakdownRequest>,
) -> Result<Json<BreakdownSelection>, ApiError> {
    let selection = state
        .pipeline
        .select_breakdown(auth.user_id, project_id, request.template_id)
        .await?;
    Ok(Json(selection))
}
