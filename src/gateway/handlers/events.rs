//! GET /events/stream - the SSE endpoint

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::Extension;
use serde::Deserialize;
use std::sync::Arc;

use super::super::state::{AppState, AuthUser};
use super::super::types::ApiError;
use crate::db::StrategyRepo;
use crate::events::sse::sse_response;

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    pub strategy_id: Option<i64>,
}

/// Opens the per-(user, strategy) event stream. 400 without a
/// strategy_id; 403 unless the caller owns the strategy or holds an
/// active subscription on it.
pub async fn event_stream(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Query(params): Query<StreamParams>,
) -> Result<Response, ApiError> {
    let strategy_id = params
        .strategy_id
        .ok_or_else(|| ApiError::bad_request("strategy_id is required"))?;

    let permitted =
        StrategyRepo::is_owner_or_active_subscriber(&state.db, user.user_id, strategy_id)
            .await
            .map_err(ApiError::db_error)?;
    if !permitted {
        return Err(ApiError::forbidden("not a subscriber of this strategy"));
    }

    let rx = state.bus.subscribe(user.user_id, strategy_id);
    Ok(sse_response(rx, state.config.sse_heartbeat).into_response())
}
