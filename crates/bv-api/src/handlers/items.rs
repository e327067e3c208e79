use axum::{
    Json,
    extract::{Path, State},
};
use serde::Deserialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use bv_common::ledger::{EditOutcome, RevertOutcome, RevertTarget};
use bv_common::model::ItemEditHistory;

use crate::SharedState;
use crate::auth::AuthUser;
use crate::error::ApiError;

const MAX_REASON_CHARS: usize = 1000;

#[derive(Debug, Deserialize)]
pub struct EditItemRequest {
    pub changes: Map<String, Value>,
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn edit(
    State(state): State<SharedState>,
    Path(item_id): Path<Uuid>,
    auth: AuthUser,
    Json(request): Json<EditItemRequest>,
) -> Result<Json<EditOutcome>, ApiError> {
    let reason = request
        .reason
        .as_deref()
        .map(str::trim)
        .filter(|reason| !reason.is_empty());
    if reason.is_some_and(|reason| reason.chars().count() > MAX_REASON_CHARS) {
        return Err(ApiError::BadRequest(format!(
            "reason must be at most {MAX_REASON_CHARS} characters"
        )));
    }

    let outcome = state
        .pipeline
        .edit_item(auth.user_id, item_id, &request.changes, reason)
        .await?;
    Ok(Json(outcome))
}

pub async fn revert(
    State(state): State<SharedState>,
    Path(item_id): Path<Uuid>,
    auth: AuthUser,
    Json(target): Json<RevertTarget>,
) -> Result<Json<RevertOutcome>, ApiError> {
    let outcome = state
        .pipeline
        .revert_item(auth.user_id, item_id, &target)
        .await?;
    Ok(Json(outcome))
}

pub async fn history(
    State(state): State<SharedState>,
    Path(item_id): Path<Uuid>,
    auth: AuthUser,
) -> Result<Json<Vec<ItemEditHistory>>, ApiError> {
    Ok(Json(state.pipeline.item_history(auth.user_id, item_id).await?))
}
