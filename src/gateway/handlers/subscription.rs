//! Subscription status and teardown
//!
//! DELETE with force=true runs the full cleanup ladder. Each step's
//! failure is collected and logged; later steps still run - a
//! half-dismantled subscription that stays blocked forever is worse
//! than one torn down with warnings.

use axum::extract::{Path, Query, State};
use axum::Extension;
use serde::Deserialize;
use std::sync::Arc;

use super::super::state::{AppState, AuthUser};
use super::super::types::{ok, ApiError, ApiResult};
use crate::db::{AccountRepo, OrderRepo, StrategyAccountRepo, StrategyRepo, TradeRepo};
use crate::events::DisconnectReason;
use crate::models::{OrderType, PlacementParams, Side};

#[derive(Debug, Deserialize)]
pub struct DeleteParams {
    #[serde(default)]
    pub force: bool,
}

/// GET /strategies/{id}/subscribe/{account_id}/status
pub async fn subscription_status(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path((strategy_id, account_id)): Path<(i64, i64)>,
) -> ApiResult<crate::db::strategies::SubscriptionStatus> {
    let sa = resolve_subscription(&state, &user, strategy_id, account_id).await?;
    let summary = StrategyAccountRepo::status_summary(&state.db, sa.strategy_account_id)
        .await
        .map_err(ApiError::db_error)?;
    ok(summary)
}

/// DELETE /strategies/{id}/subscribe/{account_id}?force=
pub async fn delete_subscription(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path((strategy_id, account_id)): Path<(i64, i64)>,
    Query(params): Query<DeleteParams>,
) -> ApiResult<serde_json::Value> {
    let sa = resolve_subscription(&state, &user, strategy_id, account_id).await?;
    let summary = StrategyAccountRepo::status_summary(&state.db, sa.strategy_account_id)
        .await
        .map_err(ApiError::db_error)?;

    if !params.force {
        if summary.active_positions > 0 {
            return Err(ApiError::conflict(format!(
                "{} active positions; retry with force=true",
                summary.active_positions
            ))
            .into());
        }
        if summary.open_orders > 0 {
            return Err(ApiError::conflict(format!(
                "{} open orders; retry with force=true",
                summary.open_orders
            ))
            .into());
        }
    }

    let account = AccountRepo::find_by_id(&state.db, account_id)
        .await
        .map_err(ApiError::db_error)?
        .ok_or_else(|| ApiError::not_found("account not found"))?;

    let mut failures: Vec<String> = Vec::new();

    // Step 1: deactivate. The committed UPDATE is the visibility flush;
    // every in-flight webhook re-checks the flag before its exchange
    // call and skips from here on.
    if let Err(e) = StrategyAccountRepo::set_active(&state.db, sa.strategy_account_id, false).await
    {
        failures.push(format!("deactivate: {}", e));
    }

    // Step 2: cancel everything still at the exchange.
    match state
        .engine
        .cancel_all(&account, sa.strategy_account_id, None)
        .await
    {
        Ok(outcome) if outcome.failed > 0 => {
            failures.push(format!("{} cancels failed", outcome.failed));
        }
        Ok(_) => {}
        Err(e) => failures.push(format!("cancel_all: {}", e)),
    }

    // Step 3: verify nothing is left open.
    match OrderRepo::active_for_strategy_account(&state.db, sa.strategy_account_id, None).await {
        Ok(remaining) if !remaining.is_empty() => {
            failures.push(format!("{} orders still active after cancel", remaining.len()));
        }
        Ok(_) => {}
        Err(e) => failures.push(format!("verify: {}", e)),
    }

    // Step 4: close positions at market.
    if let Err(e) = close_positions(&state, &account, sa.strategy_account_id, &mut failures).await
    {
        failures.push(format!("close positions: {}", e));
    }

    // Step 5: end the SSE streams for this key.
    state
        .bus
        .disconnect_all(user.user_id, strategy_id, DisconnectReason::PermissionRevoked)
        .await;

    // Step 6: log whatever went wrong; teardown continues regardless.
    if !failures.is_empty() {
        tracing::warn!(
            strategy_id,
            account_id,
            failures = ?failures,
            "Forced unsubscribe finished with failures"
        );
    }

    // Step 7: drop the edge; orders/trades/positions cascade.
    StrategyAccountRepo::delete(&state.db, sa.strategy_account_id)
        .await
        .map_err(ApiError::db_error)?;

    ok(serde_json::json!({
        "deleted": true,
        "failures": failures,
    }))
}

async fn close_positions(
    state: &AppState,
    account: &crate::models::Account,
    strategy_account_id: i64,
    failures: &mut Vec<String>,
) -> Result<(), ApiError> {
    let positions = TradeRepo::open_positions(&state.db)
        .await
        .map_err(ApiError::db_error)?;

    for position in positions
        .iter()
        .filter(|p| p.strategy_account_id == strategy_account_id && !p.is_flat())
    {
        let side = if position.is_long() {
            Side::Sell
        } else {
            Side::Buy
        };
        let params = PlacementParams {
            strategy_account_id,
            symbol: position.symbol.clone(),
            side,
            order_type: OrderType::Market,
            quantity: position.quantity.abs(),
            price: None,
            stop_price: None,
            market_type: account.market_type,
        };
        if let Err(e) = state.engine.create_order(account, params).await {
            failures.push(format!("close {}: {}", position.symbol, e));
        }
    }
    Ok(())
}

async fn resolve_subscription(
    state: &AppState,
    user: &AuthUser,
    strategy_id: i64,
    account_id: i64,
) -> Result<crate::models::StrategyAccount, ApiError> {
    let strategy = StrategyRepo::find_by_id(&state.db, strategy_id)
        .await
        .map_err(ApiError::db_error)?
        .ok_or_else(|| ApiError::not_found("strategy not found"))?;

    let account = AccountRepo::find_by_id(&state.db, account_id)
        .await
        .map_err(ApiError::db_error)?
        .ok_or_else(|| ApiError::not_found("account not found"))?;

    // The account owner manages the subscription; the strategy owner may
    // manage subscriptions on their own strategy.
    if account.owner_user_id != user.user_id && strategy.owner_user_id != user.user_id {
        return Err(ApiError::forbidden("not your subscription"));
    }

    StrategyAccountRepo::find(&state.db, strategy_id, account_id)
        .await
        .map_err(ApiError::db_error)?
        .ok_or_else(|| ApiError::not_found("subscription not found"))
}
