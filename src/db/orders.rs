//! Order and pending-order repositories
//!
//! The create flow inserts the row BEFORE the exchange call (with a
//! `PENDING-<uuid>` marker satisfying the unique index), so a crash at
//! any point leaves a tracked row rather than an orphan exchange order.
//! Transitions are CAS updates guarded by the expected current status.

use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::Row;
use std::time::Duration;

use super::strategies::active_ids;
use super::{Database, DbError};
use crate::models::{
    pending_marker, sort_price, Exchange, Id, MarketType, Order, OrderStatus, OrderType,
    PendingOrder, PlacementParams, Side,
};

const ORDER_COLS: &str = "order_id, strategy_account_id, symbol, side, order_type, quantity, \
     filled_quantity, price, stop_price, market_type, status, exchange_order_id, \
     error_message, cancel_attempted_at, created_at, updated_at";

const PENDING_COLS: &str = "pending_order_id, strategy_account_id, account_id, symbol, side, \
     order_type, quantity, price, stop_price, market_type, priority, sort_price, \
     created_at, updated_at";

fn order_from_row(row: &PgRow) -> Result<Order, DbError> {
    let side: i16 = row.try_get("side")?;
    let order_type: i16 = row.try_get("order_type")?;
    let market_type: i16 = row.try_get("market_type")?;
    let status: i16 = row.try_get("status")?;
    Ok(Order {
        order_id: row.try_get("order_id")?,
        strategy_account_id: row.try_get("strategy_account_id")?,
        symbol: row.try_get("symbol")?,
        side: Side::from_id(side).ok_or_else(|| DbError::Corrupt(format!("side {}", side)))?,
        order_type: OrderType::from_id(order_type)
            .ok_or_else(|| DbError::Corrupt(format!("order_type {}", order_type)))?,
        quantity: row.try_get("quantity")?,
        filled_quantity: row.try_get("filled_quantity")?,
        price: row.try_get("price")?,
        stop_price: row.try_get("stop_price")?,
        market_type: MarketType::from_id(market_type)
            .ok_or_else(|| DbError::Corrupt(format!("market_type {}", market_type)))?,
        status: OrderStatus::from_id(status)
            .ok_or_else(|| DbError::Corrupt(format!("status {}", status)))?,
        exchange_order_id: row.try_get("exchange_order_id")?,
        error_message: row.try_get("error_message")?,
        cancel_attempted_at: row.try_get("cancel_attempted_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn pending_from_row(row: &PgRow) -> Result<PendingOrder, DbError> {
    let side: i16 = row.try_get("side")?;
    let order_type: i16 = row.try_get("order_type")?;
    let market_type: i16 = row.try_get("market_type")?;
    Ok(PendingOrder {
        pending_order_id: row.try_get("pending_order_id")?,
        strategy_account_id: row.try_get("strategy_account_id")?,
        account_id: row.try_get("account_id")?,
        symbol: row.try_get("symbol")?,
        side: Side::from_id(side).ok_or_else(|| DbError::Corrupt(format!("side {}", side)))?,
        order_type: OrderType::from_id(order_type)
            .ok_or_else(|| DbError::Corrupt(format!("order_type {}", order_type)))?,
        quantity: row.try_get("quantity")?,
        price: row.try_get("price")?,
        stop_price: row.try_get("stop_price")?,
        market_type: MarketType::from_id(market_type)
            .ok_or_else(|| DbError::Corrupt(format!("market_type {}", market_type)))?,
        priority: row.try_get("priority")?,
        sort_price: row.try_get("sort_price")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Join context resolved alongside an order: who sees its events and
/// which exchange account it belongs to.
#[derive(Debug, Clone)]
pub struct OrderContext {
    pub user_id: Id,
    pub strategy_id: Id,
    pub account_id: Id,
    pub account_name: String,
    pub exchange: Exchange,
}

/// Order repository
pub struct OrderRepo;

impl OrderRepo {
    /// Step 1 of the create flow: insert the PENDING row and commit.
    /// Returns the full row including the generated marker.
    pub async fn insert_pending(db: &Database, params: &PlacementParams) -> Result<Order, DbError> {
        let marker = pending_marker();
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO orders_tb
                (strategy_account_id, symbol, side, order_type, quantity, filled_quantity,
                 price, stop_price, market_type, status, exchange_order_id)
            VALUES ($1, $2, $3, $4, $5, 0, $6, $7, $8, $9, $10)
            RETURNING {}
            "#,
            ORDER_COLS
        ))
        .bind(params.strategy_account_id)
        .bind(&params.symbol)
        .bind(params.side.id())
        .bind(params.order_type.id())
        .bind(params.quantity)
        .bind(params.price)
        .bind(params.stop_price)
        .bind(params.market_type.id())
        .bind(OrderStatus::Pending.id())
        .bind(&marker)
        .fetch_one(db.pool())
        .await?;

        order_from_row(&row)
    }

    /// Step 3a: the exchange acknowledged. Replace the marker with the
    /// real id and open the order. CAS from PENDING.
    pub async fn mark_open(
        db: &Database,
        order_id: Id,
        exchange_order_id: &str,
    ) -> Result<bool, DbError> {
        let result = sqlx::query(
            "UPDATE orders_tb SET status = $1, exchange_order_id = $2, updated_at = NOW() \
             WHERE order_id = $3 AND status = $4",
        )
        .bind(OrderStatus::Open.id())
        .bind(exchange_order_id)
        .bind(order_id)
        .bind(OrderStatus::Pending.id())
        .execute(db.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Step 3b: the exchange call failed. CAS PENDING -> FAILED with the
    /// sanitized error.
    pub async fn mark_failed(db: &Database, order_id: Id, error: &str) -> Result<bool, DbError> {
        let result = sqlx::query(
            "UPDATE orders_tb SET status = $1, error_message = $2, updated_at = NOW() \
             WHERE order_id = $3 AND status = $4",
        )
        .bind(OrderStatus::Failed.id())
        .bind(error)
        .bind(order_id)
        .bind(OrderStatus::Pending.id())
        .execute(db.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Cancel step 1: OPEN | NEW | PARTIALLY_FILLED -> CANCELLING with the
    /// attempt timestamp.
    pub async fn mark_cancelling(db: &Database, order_id: Id) -> Result<bool, DbError> {
        let result = sqlx::query(
            "UPDATE orders_tb SET status = $1, cancel_attempted_at = NOW(), updated_at = NOW() \
             WHERE order_id = $2 AND status IN ($3, $4, $5)",
        )
        .bind(OrderStatus::Cancelling.id())
        .bind(order_id)
        .bind(OrderStatus::New.id())
        .bind(OrderStatus::Open.id())
        .bind(OrderStatus::PartiallyFilled.id())
        .execute(db.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Cancel step 3a: exchange acknowledged the cancel.
    pub async fn mark_cancelled(db: &Database, order_id: Id) -> Result<bool, DbError> {
        let result = sqlx::query(
            "UPDATE orders_tb SET status = $1, updated_at = NOW() \
             WHERE order_id = $2 AND status = $3",
        )
        .bind(OrderStatus::Cancelled.id())
        .bind(order_id)
        .bind(OrderStatus::Cancelling.id())
        .execute(db.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Cancel step 3b: the cancel failed; restore OPEN and record why.
    pub async fn restore_open(db: &Database, order_id: Id, error: &str) -> Result<bool, DbError> {
        let result = sqlx::query(
            "UPDATE orders_tb SET status = $1, error_message = $2, updated_at = NOW() \
             WHERE order_id = $3 AND status = $4",
        )
        .bind(OrderStatus::Open.id())
        .bind(error)
        .bind(order_id)
        .bind(OrderStatus::Cancelling.id())
        .execute(db.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Apply a fill-progress update (OPEN/NEW -> PARTIALLY_FILLED, or a
    /// refreshed filled_quantity on an already partially filled order).
    pub async fn update_fill(
        db: &Database,
        order_id: Id,
        filled_quantity: Decimal,
        status: OrderStatus,
    ) -> Result<bool, DbError> {
        let result = sqlx::query(&format!(
            "UPDATE orders_tb SET filled_quantity = $1, status = $2, updated_at = NOW() \
             WHERE order_id = $3 AND status IN ({})",
            active_ids()
        ))
        .bind(filled_quantity)
        .bind(status.id())
        .bind(order_id)
        .execute(db.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Force a terminal exchange-side outcome (EXPIRED / REJECTED / the
    /// sweeper's FAILED) from any still-active state.
    pub async fn mark_terminal(
        db: &Database,
        order_id: Id,
        status: OrderStatus,
        error: Option<&str>,
    ) -> Result<bool, DbError> {
        debug_assert!(status.is_terminal());
        let result = sqlx::query(&format!(
            "UPDATE orders_tb SET status = $1, error_message = COALESCE($2, error_message), \
             updated_at = NOW() WHERE order_id = $3 AND status IN ({})",
            active_ids()
        ))
        .bind(status.id())
        .bind(error)
        .bind(order_id)
        .execute(db.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Remove a settled row. Terminal history lives in trades_tb.
    pub async fn delete(db: &Database, order_id: Id) -> Result<bool, DbError> {
        let result = sqlx::query("DELETE FROM orders_tb WHERE order_id = $1")
            .bind(order_id)
            .execute(db.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Transaction-scoped variant of [`Self::delete`] for the fill
    /// settlement path.
    pub async fn delete_tx(conn: &mut sqlx::PgConnection, order_id: Id) -> Result<bool, DbError> {
        let result = sqlx::query("DELETE FROM orders_tb WHERE order_id = $1")
            .bind(order_id)
            .execute(conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Transaction-scoped variant of [`Self::update_fill`].
    pub async fn update_fill_tx(
        conn: &mut sqlx::PgConnection,
        order_id: Id,
        filled_quantity: Decimal,
        status: OrderStatus,
    ) -> Result<bool, DbError> {
        let result = sqlx::query(&format!(
            "UPDATE orders_tb SET filled_quantity = $1, status = $2, updated_at = NOW() \
             WHERE order_id = $3 AND status IN ({})",
            active_ids()
        ))
        .bind(filled_quantity)
        .bind(status.id())
        .bind(order_id)
        .execute(conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn find_by_id(db: &Database, order_id: Id) -> Result<Option<Order>, DbError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM orders_tb WHERE order_id = $1",
            ORDER_COLS
        ))
        .bind(order_id)
        .fetch_optional(db.pool())
        .await?;
        row.map(|r| order_from_row(&r)).transpose()
    }

    /// Resolve an order together with its event-routing context, inside
    /// the caller's transaction. Uses `FOR UPDATE SKIP LOCKED` on the
    /// order row so concurrent reconciliation paths (stream + poll)
    /// serialize without starving each other; the caller should treat
    /// `None` as "someone else has it" and move on.
    pub async fn lock_with_context(
        conn: &mut sqlx::PgConnection,
        exchange_order_id: &str,
    ) -> Result<Option<(Order, OrderContext)>, DbError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {order_cols},
                   s.owner_user_id AS ctx_user_id, sa.strategy_id AS ctx_strategy_id,
                   sa.account_id AS ctx_account_id, a.display_name AS ctx_account_name,
                   a.exchange AS ctx_exchange
            FROM (
                SELECT * FROM orders_tb WHERE exchange_order_id = $1
                FOR UPDATE SKIP LOCKED
            ) o
            JOIN strategy_accounts_tb sa ON sa.strategy_account_id = o.strategy_account_id
            JOIN accounts_tb a ON a.account_id = sa.account_id
            JOIN strategies_tb s ON s.strategy_id = sa.strategy_id
            "#,
            order_cols = "o.order_id, o.strategy_account_id, o.symbol, o.side, o.order_type, \
                 o.quantity, o.filled_quantity, o.price, o.stop_price, o.market_type, \
                 o.status, o.exchange_order_id, o.error_message, o.cancel_attempted_at, \
                 o.created_at, o.updated_at"
        ))
        .bind(exchange_order_id)
        .fetch_optional(conn)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let order = order_from_row(&row)?;
        let exchange: i16 = row.try_get("ctx_exchange")?;
        let ctx = OrderContext {
            user_id: row.try_get("ctx_user_id")?,
            strategy_id: row.try_get("ctx_strategy_id")?,
            account_id: row.try_get("ctx_account_id")?,
            account_name: row.try_get("ctx_account_name")?,
            exchange: Exchange::from_id(exchange)
                .ok_or_else(|| DbError::Corrupt(format!("exchange {}", exchange)))?,
        };
        Ok(Some((order, ctx)))
    }

    pub async fn context_for(
        db: &Database,
        strategy_account_id: Id,
    ) -> Result<Option<OrderContext>, DbError> {
        let row = sqlx::query(
            r#"
            SELECT s.owner_user_id AS ctx_user_id, sa.strategy_id AS ctx_strategy_id,
                   sa.account_id AS ctx_account_id, a.display_name AS ctx_account_name,
                   a.exchange AS ctx_exchange
            FROM strategy_accounts_tb sa
            JOIN accounts_tb a ON a.account_id = sa.account_id
            JOIN strategies_tb s ON s.strategy_id = sa.strategy_id
            WHERE sa.strategy_account_id = $1
            "#,
        )
        .bind(strategy_account_id)
        .fetch_optional(db.pool())
        .await?;

        let Some(row) = row else { return Ok(None) };
        let exchange: i16 = row.try_get("ctx_exchange")?;
        Ok(Some(OrderContext {
            user_id: row.try_get("ctx_user_id")?,
            strategy_id: row.try_get("ctx_strategy_id")?,
            account_id: row.try_get("ctx_account_id")?,
            account_name: row.try_get("ctx_account_name")?,
            exchange: Exchange::from_id(exchange)
                .ok_or_else(|| DbError::Corrupt(format!("exchange {}", exchange)))?,
        }))
    }

    /// Active orders on one (account, symbol) scheduling key.
    pub async fn active_for_key(
        db: &Database,
        account_id: Id,
        symbol: &str,
    ) -> Result<Vec<Order>, DbError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {order_cols}
            FROM orders_tb o
            JOIN strategy_accounts_tb sa ON sa.strategy_account_id = o.strategy_account_id
            WHERE sa.account_id = $1 AND o.symbol = $2 AND o.status IN ({active})
            ORDER BY o.created_at
            "#,
            order_cols = "o.order_id, o.strategy_account_id, o.symbol, o.side, o.order_type, \
                 o.quantity, o.filled_quantity, o.price, o.stop_price, o.market_type, \
                 o.status, o.exchange_order_id, o.error_message, o.cancel_attempted_at, \
                 o.created_at, o.updated_at",
            active = active_ids()
        ))
        .bind(account_id)
        .bind(symbol)
        .fetch_all(db.pool())
        .await?;

        rows.iter().map(order_from_row).collect()
    }

    /// Active orders for one subscription, optionally narrowed to a symbol.
    pub async fn active_for_strategy_account(
        db: &Database,
        strategy_account_id: Id,
        symbol: Option<&str>,
    ) -> Result<Vec<Order>, DbError> {
        let base = format!(
            "SELECT {} FROM orders_tb WHERE strategy_account_id = $1 AND status IN ({})",
            ORDER_COLS,
            active_ids()
        );
        let rows = match symbol {
            Some(sym) => {
                sqlx::query(&format!("{} AND symbol = $2 ORDER BY created_at", base))
                    .bind(strategy_account_id)
                    .bind(sym)
                    .fetch_all(db.pool())
                    .await?
            }
            None => {
                sqlx::query(&format!("{} ORDER BY created_at", base))
                    .bind(strategy_account_id)
                    .fetch_all(db.pool())
                    .await?
            }
        };
        rows.iter().map(order_from_row).collect()
    }

    /// Non-terminal rows tracked by the reconciler for one account.
    pub async fn active_for_account(db: &Database, account_id: Id) -> Result<Vec<Order>, DbError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {order_cols}
            FROM orders_tb o
            JOIN strategy_accounts_tb sa ON sa.strategy_account_id = o.strategy_account_id
            WHERE sa.account_id = $1 AND o.status IN ({active})
            ORDER BY o.created_at
            "#,
            order_cols = "o.order_id, o.strategy_account_id, o.symbol, o.side, o.order_type, \
                 o.quantity, o.filled_quantity, o.price, o.stop_price, o.market_type, \
                 o.status, o.exchange_order_id, o.error_message, o.cancel_attempted_at, \
                 o.created_at, o.updated_at",
            active = active_ids()
        ))
        .bind(account_id)
        .fetch_all(db.pool())
        .await?;
        rows.iter().map(order_from_row).collect()
    }

    /// (account_id, symbol) keys with at least one active order.
    pub async fn active_keys(db: &Database) -> Result<Vec<(Id, String)>, DbError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT DISTINCT sa.account_id, o.symbol
            FROM orders_tb o
            JOIN strategy_accounts_tb sa ON sa.strategy_account_id = o.strategy_account_id
            WHERE o.status IN ({})
            "#,
            active_ids()
        ))
        .fetch_all(db.pool())
        .await?;
        rows.iter()
            .map(|r| Ok((r.try_get("account_id")?, r.try_get("symbol")?)))
            .collect()
    }

    /// Rows stuck in PENDING longer than the threshold (crash between the
    /// insert and the exchange acknowledgement).
    pub async fn stuck_pending(db: &Database, threshold: Duration) -> Result<Vec<Order>, DbError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM orders_tb WHERE status = $1 AND \
             created_at < NOW() - make_interval(secs => $2)",
            ORDER_COLS
        ))
        .bind(OrderStatus::Pending.id())
        .bind(threshold.as_secs() as f64)
        .fetch_all(db.pool())
        .await?;
        rows.iter().map(order_from_row).collect()
    }

    /// Rows whose cancel request never resolved.
    pub async fn stale_cancelling(
        db: &Database,
        threshold: Duration,
    ) -> Result<Vec<Order>, DbError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM orders_tb WHERE status = $1 AND \
             cancel_attempted_at < NOW() - make_interval(secs => $2)",
            ORDER_COLS
        ))
        .bind(OrderStatus::Cancelling.id())
        .bind(threshold.as_secs() as f64)
        .fetch_all(db.pool())
        .await?;
        rows.iter().map(order_from_row).collect()
    }

}

/// Pending-order (local queue) repository
pub struct PendingOrderRepo;

impl PendingOrderRepo {
    /// Queue an order locally. `sort_price` is derived here so every
    /// insert path agrees on the ranking rule.
    pub async fn insert(
        db: &Database,
        account_id: Id,
        params: &PlacementParams,
        priority: i32,
    ) -> Result<PendingOrder, DbError> {
        let sp = sort_price(params.side, params.order_type, params.price, params.stop_price);
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO pending_orders_tb
                (strategy_account_id, account_id, symbol, side, order_type, quantity,
                 price, stop_price, market_type, priority, sort_price)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING {}
            "#,
            PENDING_COLS
        ))
        .bind(params.strategy_account_id)
        .bind(account_id)
        .bind(&params.symbol)
        .bind(params.side.id())
        .bind(params.order_type.id())
        .bind(params.quantity)
        .bind(params.price)
        .bind(params.stop_price)
        .bind(params.market_type.id())
        .bind(priority)
        .bind(sp)
        .fetch_one(db.pool())
        .await?;

        pending_from_row(&row)
    }

    /// Queue rows for one scheduling key, best first.
    pub async fn ranked_for_key(
        db: &Database,
        account_id: Id,
        symbol: &str,
    ) -> Result<Vec<PendingOrder>, DbError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM pending_orders_tb WHERE account_id = $1 AND symbol = $2 \
             ORDER BY priority ASC, sort_price DESC, created_at ASC",
            PENDING_COLS
        ))
        .bind(account_id)
        .bind(symbol)
        .fetch_all(db.pool())
        .await?;
        rows.iter().map(pending_from_row).collect()
    }

    /// (account_id, symbol) keys with queued rows.
    pub async fn keys(db: &Database) -> Result<Vec<(Id, String)>, DbError> {
        let rows = sqlx::query("SELECT DISTINCT account_id, symbol FROM pending_orders_tb")
            .fetch_all(db.pool())
            .await?;
        rows.iter()
            .map(|r| Ok((r.try_get("account_id")?, r.try_get("symbol")?)))
            .collect()
    }

    /// Drop a queue row (after a successful promotion, or a CANCEL intent).
    pub async fn delete(db: &Database, pending_order_id: Id) -> Result<bool, DbError> {
        let result = sqlx::query("DELETE FROM pending_orders_tb WHERE pending_order_id = $1")
            .bind(pending_order_id)
            .execute(db.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_for_key(
        db: &Database,
        strategy_account_id: Id,
        symbol: Option<&str>,
    ) -> Result<u64, DbError> {
        let result = match symbol {
            Some(sym) => {
                sqlx::query(
                    "DELETE FROM pending_orders_tb WHERE strategy_account_id = $1 AND symbol = $2",
                )
                .bind(strategy_account_id)
                .bind(sym)
                .execute(db.pool())
                .await?
            }
            None => {
                sqlx::query("DELETE FROM pending_orders_tb WHERE strategy_account_id = $1")
                    .bind(strategy_account_id)
                    .execute(db.pool())
                    .await?
            }
        };
        Ok(result.rows_affected())
    }
}
