use axum::{
    Json,
    extract::{Query, State},
};
use serde::Deserialize;

use bv_common::model::BreakdownOption;

use crate::SharedState;
use crate::auth::AuthUser;
use crate::error::ApiError;

#[derive(Debug, Deserialize, Default)]
pub struct BreakdownQuery {
    #[serde(default)]
    pub trade_type: String,
}

pub async fn list(
    State(state): State<SharedState>,
    Query(query): Query<BreakdownQuery>,
    _auth: AuthUser,
) -> Result<Json<Vec<BreakdownOption>>, ApiError> {
    let trade_type = query.trade_type.trim();
    if trade_type.is_empty() {
        return Err(ApiError::BadRequest("trade_type is required".into()));
    }
    Ok(Json(state.pipeline.breakdown_options(trade_type).await?))
}
