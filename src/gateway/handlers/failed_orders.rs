//! Failed-order inspection and retry

use axum::extract::{Path, State};
use axum::Extension;
use serde::Serialize;
use std::sync::Arc;

use super::super::state::{AppState, AuthUser};
use super::super::types::{ok, ApiError, ApiResult};
use crate::db::{AccountRepo, FailedOrderRepo, StrategyAccountRepo};
use crate::models::FailedOrder;

#[derive(Debug, Serialize)]
pub struct FailedOrderView {
    pub failed_order_id: i64,
    pub symbol: String,
    pub side: String,
    pub order_type: String,
    pub quantity: rust_decimal::Decimal,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exchange_error: Option<String>,
    pub status: String,
    pub retry_count: i32,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl From<&FailedOrder> for FailedOrderView {
    fn from(f: &FailedOrder) -> Self {
        Self {
            failed_order_id: f.failed_order_id,
            symbol: f.symbol.clone(),
            side: f.side.as_str().to_string(),
            order_type: f.order_type.as_str().to_string(),
            quantity: f.quantity,
            reason: f.reason.clone(),
            exchange_error: f.exchange_error.clone(),
            status: f.status.as_str().to_string(),
            retry_count: f.retry_count,
            created_at: f.created_at,
        }
    }
}

/// GET /failed-orders
pub async fn list_failed_orders(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Vec<FailedOrderView>> {
    let rows = FailedOrderRepo::list_for_user(&state.db, user.user_id)
        .await
        .map_err(ApiError::db_error)?;
    ok(rows.iter().map(FailedOrderView::from).collect())
}

/// POST /failed-orders/{id}/retry
pub async fn retry_failed_order(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(failed_order_id): Path<i64>,
) -> ApiResult<serde_json::Value> {
    ensure_ownership(&state, &user, failed_order_id).await?;

    let failed = FailedOrderRepo::find_by_id(&state.db, failed_order_id)
        .await
        .map_err(ApiError::db_error)?
        .ok_or_else(|| ApiError::not_found("failed order not found"))?;

    let sa = StrategyAccountRepo::find_by_id(&state.db, failed.strategy_account_id)
        .await
        .map_err(ApiError::db_error)?
        .ok_or_else(|| ApiError::not_found("subscription no longer exists"))?;
    let account = AccountRepo::find_by_id(&state.db, sa.account_id)
        .await
        .map_err(ApiError::db_error)?
        .ok_or_else(|| ApiError::not_found("account no longer exists"))?;

    match state
        .engine
        .retry_failed(&account, failed_order_id, state.config.max_retry)
        .await
    {
        Ok(order) => ok(serde_json::json!({
            "order_id": order.order_id,
            "status": order.status.as_str(),
        })),
        Err(e) => Err(ApiError::bad_request(e.to_string()).into()),
    }
}

/// DELETE /failed-orders/{id}
pub async fn remove_failed_order(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(failed_order_id): Path<i64>,
) -> ApiResult<serde_json::Value> {
    ensure_ownership(&state, &user, failed_order_id).await?;

    let removed = FailedOrderRepo::mark_removed(&state.db, failed_order_id)
        .await
        .map_err(ApiError::db_error)?;
    if !removed {
        return Err(ApiError::not_found("failed order not found or already removed").into());
    }
    ok(serde_json::json!({"removed": true}))
}

async fn ensure_ownership(
    state: &AppState,
    user: &AuthUser,
    failed_order_id: i64,
) -> Result<(), ApiError> {
    let owned = FailedOrderRepo::is_owned_by(&state.db, failed_order_id, user.user_id)
        .await
        .map_err(ApiError::db_error)?;
    if !owned {
        return Err(ApiError::forbidden("not your failed order"));
    }
    Ok(())
}
