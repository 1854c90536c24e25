//! Failed-order post-mortem repository
//!
//! Exchange-rejected placements land here with a sanitized error and a
//! full params snapshot, so the user can inspect and manually retry.

use sqlx::postgres::PgRow;
use sqlx::Row;

use super::{Database, DbError};
use crate::models::{FailedOrder, FailedOrderStatus, Id, OrderType, PlacementParams, Side};

const FAILED_COLS: &str = "failed_order_id, strategy_account_id, symbol, side, order_type, \
     quantity, price, stop_price, reason, exchange_error, params_json, status, retry_count, \
     created_at, updated_at";

fn failed_from_row(row: &PgRow) -> Result<FailedOrder, DbError> {
    let side: i16 = row.try_get("side")?;
    let order_type: i16 = row.try_get("order_type")?;
    let status: i16 = row.try_get("status")?;
    Ok(FailedOrder {
        failed_order_id: row.try_get("failed_order_id")?,
        strategy_account_id: row.try_get("strategy_account_id")?,
        symbol: row.try_get("symbol")?,
        side: Side::from_id(side).ok_or_else(|| DbError::Corrupt(format!("side {}", side)))?,
        order_type: OrderType::from_id(order_type)
            .ok_or_else(|| DbError::Corrupt(format!("order_type {}", order_type)))?,
        quantity: row.try_get("quantity")?,
        price: row.try_get("price")?,
        stop_price: row.try_get("stop_price")?,
        reason: row.try_get("reason")?,
        exchange_error: row.try_get("exchange_error")?,
        params_json: row.try_get("params_json")?,
        status: FailedOrderStatus::from_id(status)
            .ok_or_else(|| DbError::Corrupt(format!("failed status {}", status)))?,
        retry_count: row.try_get("retry_count")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub struct FailedOrderRepo;

impl FailedOrderRepo {
    /// Record a rejected placement. `reason` and `exchange_error` must
    /// already be sanitized/truncated by the caller.
    pub async fn insert(
        db: &Database,
        params: &PlacementParams,
        reason: &str,
        exchange_error: Option<&str>,
    ) -> Result<FailedOrder, DbError> {
        let params_json = serde_json::to_value(params)
            .map_err(|e| DbError::Corrupt(format!("params snapshot: {}", e)))?;
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO failed_orders_tb
                (strategy_account_id, symbol, side, order_type, quantity, price, stop_price,
                 reason, exchange_error, params_json, status, retry_count)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 0)
            RETURNING {}
            "#,
            FAILED_COLS
        ))
        .bind(params.strategy_account_id)
        .bind(&params.symbol)
        .bind(params.side.id())
        .bind(params.order_type.id())
        .bind(params.quantity)
        .bind(params.price)
        .bind(params.stop_price)
        .bind(reason)
        .bind(exchange_error)
        .bind(&params_json)
        .bind(FailedOrderStatus::PendingRetry.id())
        .fetch_one(db.pool())
        .await?;

        failed_from_row(&row)
    }

    pub async fn find_by_id(
        db: &Database,
        failed_order_id: Id,
    ) -> Result<Option<FailedOrder>, DbError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM failed_orders_tb WHERE failed_order_id = $1",
            FAILED_COLS
        ))
        .bind(failed_order_id)
        .fetch_optional(db.pool())
        .await?;
        row.map(|r| failed_from_row(&r)).transpose()
    }

    /// Failed orders visible to a user (through accounts they own).
    pub async fn list_for_user(db: &Database, user_id: Id) -> Result<Vec<FailedOrder>, DbError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {cols}
            FROM failed_orders_tb f
            JOIN strategy_accounts_tb sa ON sa.strategy_account_id = f.strategy_account_id
            JOIN accounts_tb a ON a.account_id = sa.account_id
            WHERE a.owner_user_id = $1 AND f.status = $2
            ORDER BY f.created_at DESC
            "#,
            cols = "f.failed_order_id, f.strategy_account_id, f.symbol, f.side, f.order_type, \
                 f.quantity, f.price, f.stop_price, f.reason, f.exchange_error, f.params_json, \
                 f.status, f.retry_count, f.created_at, f.updated_at"
        ))
        .bind(user_id)
        .bind(FailedOrderStatus::PendingRetry.id())
        .fetch_all(db.pool())
        .await?;
        rows.iter().map(failed_from_row).collect()
    }

    /// Claim one retry attempt. CAS on the retry cap, so two concurrent
    /// retry requests cannot exceed it.
    pub async fn claim_retry(
        db: &Database,
        failed_order_id: Id,
        max_retry: u32,
    ) -> Result<bool, DbError> {
        let result = sqlx::query(
            "UPDATE failed_orders_tb SET retry_count = retry_count + 1, updated_at = NOW() \
             WHERE failed_order_id = $1 AND status = $2 AND retry_count < $3",
        )
        .bind(failed_order_id)
        .bind(FailedOrderStatus::PendingRetry.id())
        .bind(max_retry as i32)
        .execute(db.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// A retry that reached OPEN retires the post-mortem row.
    pub async fn mark_removed(db: &Database, failed_order_id: Id) -> Result<bool, DbError> {
        let result = sqlx::query(
            "UPDATE failed_orders_tb SET status = $1, updated_at = NOW() \
             WHERE failed_order_id = $2 AND status = $3",
        )
        .bind(FailedOrderStatus::Removed.id())
        .bind(failed_order_id)
        .bind(FailedOrderStatus::PendingRetry.id())
        .execute(db.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// True when the failed order belongs to one of the user's accounts.
    pub async fn is_owned_by(
        db: &Database,
        failed_order_id: Id,
        user_id: Id,
    ) -> Result<bool, DbError> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM failed_orders_tb f
            JOIN strategy_accounts_tb sa ON sa.strategy_account_id = f.strategy_account_id
            JOIN accounts_tb a ON a.account_id = sa.account_id
            WHERE f.failed_order_id = $1 AND a.owner_user_id = $2
            "#,
        )
        .bind(failed_order_id)
        .bind(user_id)
        .fetch_one(db.pool())
        .await?;
        Ok(count > 0)
    }
}
