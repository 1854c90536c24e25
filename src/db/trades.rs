//! Trade, execution and position repositories
//!
//! Fill settlement is transactional: the execution insert, the trade
//! aggregate, the position update and the terminal order delete all
//! commit or roll back together. Methods here therefore take a
//! `PgConnection` so the reconciler can thread one transaction through.

use rust_decimal::prelude::Signed;
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Row};

use super::{Database, DbError};
use crate::models::{Id, OrderType, Position, Side, Trade};

const POSITION_COLS: &str = "position_id, strategy_account_id, symbol, quantity, entry_price, \
     mark_price, unrealized_pnl, created_at, updated_at";

fn position_from_row(row: &PgRow) -> Result<Position, DbError> {
    Ok(Position {
        position_id: row.try_get("position_id")?,
        strategy_account_id: row.try_get("strategy_account_id")?,
        symbol: row.try_get("symbol")?,
        quantity: row.try_get("quantity")?,
        entry_price: row.try_get("entry_price")?,
        mark_price: row.try_get("mark_price")?,
        unrealized_pnl: row.try_get("unrealized_pnl")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// A single normalized fill, as delivered by the user stream or derived
/// from a poll diff.
#[derive(Debug, Clone)]
pub struct Fill {
    pub exchange_trade_id: String,
    pub exchange_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub price: Decimal,
    pub quantity: Decimal,
    pub commission: Decimal,
    pub commission_asset: Option<String>,
    pub is_maker: bool,
}

/// Outcome of applying one fill to a signed position.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionDelta {
    pub new_quantity: Decimal,
    pub new_entry_price: Decimal,
    pub realized_pnl: Decimal,
    /// True when the fill flipped the position through zero (close + open
    /// at the new side).
    pub crossed_zero: bool,
}

/// Signed-position arithmetic. BUY adds, SELL subtracts; crossing zero
/// splits into a close at the old entry and an open at the fill price.
pub fn apply_fill_math(
    position_qty: Decimal,
    entry_price: Decimal,
    side: Side,
    fill_qty: Decimal,
    fill_price: Decimal,
) -> PositionDelta {
    let delta = match side {
        Side::Buy => fill_qty,
        Side::Sell => -fill_qty,
    };
    let new_qty = position_qty + delta;

    // Flat or same-direction increase: weighted-average entry, no PnL.
    if position_qty.is_zero() || (position_qty.signum() == delta.signum()) {
        let total = position_qty.abs() + delta.abs();
        let entry = if total.is_zero() {
            Decimal::ZERO
        } else {
            (entry_price * position_qty.abs() + fill_price * delta.abs()) / total
        };
        return PositionDelta {
            new_quantity: new_qty,
            new_entry_price: entry,
            realized_pnl: Decimal::ZERO,
            crossed_zero: false,
        };
    }

    // Opposite direction: some or all of the position closes.
    let closed = position_qty.abs().min(delta.abs());
    // Long positions realize (exit - entry), shorts the opposite.
    let realized = (fill_price - entry_price) * closed * position_qty.signum();

    if delta.abs() <= position_qty.abs() {
        // Pure reduction; entry price survives (flat resets it).
        PositionDelta {
            new_quantity: new_qty,
            new_entry_price: if new_qty.is_zero() { Decimal::ZERO } else { entry_price },
            realized_pnl: realized,
            crossed_zero: false,
        }
    } else {
        // Zero-cross: remainder opens at the fill price on the new side.
        PositionDelta {
            new_quantity: new_qty,
            new_entry_price: fill_price,
            realized_pnl: realized,
            crossed_zero: true,
        }
    }
}

pub struct TradeRepo;

impl TradeRepo {
    /// At-most-once fill accounting: the unique index on
    /// `exchange_trade_id` absorbs replays. Returns false for a duplicate.
    pub async fn record_execution(
        conn: &mut PgConnection,
        strategy_account_id: Id,
        fill: &Fill,
        realized_pnl: Decimal,
    ) -> Result<bool, DbError> {
        let result = sqlx::query(
            r#"
            INSERT INTO trade_executions_tb
                (strategy_account_id, exchange_trade_id, exchange_order_id, symbol, side,
                 price, quantity, commission, commission_asset, is_maker, realized_pnl)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (exchange_trade_id) DO NOTHING
            "#,
        )
        .bind(strategy_account_id)
        .bind(&fill.exchange_trade_id)
        .bind(&fill.exchange_order_id)
        .bind(&fill.symbol)
        .bind(fill.side.id())
        .bind(fill.price)
        .bind(fill.quantity)
        .bind(fill.commission)
        .bind(&fill.commission_asset)
        .bind(fill.is_maker)
        .bind(realized_pnl)
        .execute(conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Aggregate trade row for a completed order: one upsert per fill,
    /// keyed by exchange_order_id, accumulating quantity and a
    /// volume-weighted average price.
    pub async fn upsert_trade(
        conn: &mut PgConnection,
        strategy_account_id: Id,
        order_type: OrderType,
        fill: &Fill,
        realized_pnl: Decimal,
    ) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO trades_tb
                (strategy_account_id, symbol, side, order_type, quantity, avg_price,
                 commission, realized_pnl, exchange_order_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (exchange_order_id) DO UPDATE SET
                avg_price = (trades_tb.avg_price * trades_tb.quantity
                             + EXCLUDED.avg_price * EXCLUDED.quantity)
                            / NULLIF(trades_tb.quantity + EXCLUDED.quantity, 0),
                quantity = trades_tb.quantity + EXCLUDED.quantity,
                commission = trades_tb.commission + EXCLUDED.commission,
                realized_pnl = trades_tb.realized_pnl + EXCLUDED.realized_pnl,
                updated_at = NOW()
            "#,
        )
        .bind(strategy_account_id)
        .bind(&fill.symbol)
        .bind(fill.side.id())
        .bind(order_type.id())
        .bind(fill.quantity)
        .bind(fill.price)
        .bind(fill.commission)
        .bind(realized_pnl)
        .bind(&fill.exchange_order_id)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Lock and load the position row for a scheduling key, if any.
    pub async fn position_for_update(
        conn: &mut PgConnection,
        strategy_account_id: Id,
        symbol: &str,
    ) -> Result<Option<Position>, DbError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM positions_tb \
             WHERE strategy_account_id = $1 AND symbol = $2 FOR UPDATE",
            POSITION_COLS
        ))
        .bind(strategy_account_id)
        .bind(symbol)
        .fetch_optional(conn)
        .await?;
        row.map(|r| position_from_row(&r)).transpose()
    }

    /// Apply a [`PositionDelta`], creating the row on first touch.
    pub async fn upsert_position(
        conn: &mut PgConnection,
        strategy_account_id: Id,
        symbol: &str,
        delta: &PositionDelta,
        mark_price: Decimal,
    ) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO positions_tb
                (strategy_account_id, symbol, quantity, entry_price, mark_price, unrealized_pnl)
            VALUES ($1, $2, $3, $4, $5, 0)
            ON CONFLICT (strategy_account_id, symbol) DO UPDATE SET
                quantity = EXCLUDED.quantity,
                entry_price = EXCLUDED.entry_price,
                mark_price = EXCLUDED.mark_price,
                unrealized_pnl = (EXCLUDED.mark_price - EXCLUDED.entry_price) * EXCLUDED.quantity,
                updated_at = NOW()
            "#,
        )
        .bind(strategy_account_id)
        .bind(symbol)
        .bind(delta.new_quantity)
        .bind(delta.new_entry_price)
        .bind(mark_price)
        .execute(conn)
        .await?;
        Ok(())
    }

    pub async fn position_for(
        db: &Database,
        strategy_account_id: Id,
        symbol: &str,
    ) -> Result<Option<Position>, DbError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM positions_tb WHERE strategy_account_id = $1 AND symbol = $2",
            POSITION_COLS
        ))
        .bind(strategy_account_id)
        .bind(symbol)
        .fetch_optional(db.pool())
        .await?;
        row.map(|r| position_from_row(&r)).transpose()
    }

    /// Every non-flat position (the PnL mark refresher walks these).
    pub async fn open_positions(db: &Database) -> Result<Vec<Position>, DbError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM positions_tb WHERE quantity <> 0",
            POSITION_COLS
        ))
        .fetch_all(db.pool())
        .await?;
        rows.iter().map(position_from_row).collect()
    }

    pub async fn update_mark(
        db: &Database,
        position_id: Id,
        mark_price: Decimal,
    ) -> Result<(), DbError> {
        sqlx::query(
            "UPDATE positions_tb SET mark_price = $1, \
             unrealized_pnl = ($1 - entry_price) * quantity, updated_at = NOW() \
             WHERE position_id = $2",
        )
        .bind(mark_price)
        .bind(position_id)
        .execute(db.pool())
        .await?;
        Ok(())
    }

    pub async fn trades_for_order(
        db: &Database,
        exchange_order_id: &str,
    ) -> Result<Option<Trade>, DbError> {
        let row = sqlx::query(
            "SELECT trade_id, strategy_account_id, symbol, side, order_type, quantity, \
             avg_price, commission, realized_pnl, exchange_order_id, created_at \
             FROM trades_tb WHERE exchange_order_id = $1",
        )
        .bind(exchange_order_id)
        .fetch_optional(db.pool())
        .await?;

        match row {
            Some(r) => {
                let side: i16 = r.try_get("side")?;
                let order_type: i16 = r.try_get("order_type")?;
                Ok(Some(Trade {
                    trade_id: r.try_get("trade_id")?,
                    strategy_account_id: r.try_get("strategy_account_id")?,
                    symbol: r.try_get("symbol")?,
                    side: Side::from_id(side)
                        .ok_or_else(|| DbError::Corrupt(format!("side {}", side)))?,
                    order_type: OrderType::from_id(order_type)
                        .ok_or_else(|| DbError::Corrupt(format!("order_type {}", order_type)))?,
                    quantity: r.try_get("quantity")?,
                    avg_price: r.try_get("avg_price")?,
                    commission: r.try_get("commission")?,
                    realized_pnl: r.try_get("realized_pnl")?,
                    exchange_order_id: r.try_get("exchange_order_id")?,
                    created_at: r.try_get("created_at")?,
                }))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::prelude::FromPrimitive;

    fn dec(v: f64) -> Decimal {
        Decimal::from_f64(v).unwrap()
    }

    #[test]
    fn test_open_from_flat() {
        let d = apply_fill_math(Decimal::ZERO, Decimal::ZERO, Side::Buy, dec(0.5), dec(100.0));
        assert_eq!(d.new_quantity, dec(0.5));
        assert_eq!(d.new_entry_price, dec(100.0));
        assert_eq!(d.realized_pnl, Decimal::ZERO);
        assert!(!d.crossed_zero);
    }

    #[test]
    fn test_same_direction_averages_entry() {
        let d = apply_fill_math(dec(1.0), dec(100.0), Side::Buy, dec(1.0), dec(110.0));
        assert_eq!(d.new_quantity, dec(2.0));
        assert_eq!(d.new_entry_price, dec(105.0));
        assert_eq!(d.realized_pnl, Decimal::ZERO);
    }

    #[test]
    fn test_partial_close_realizes_pnl() {
        // Long 1.0 @ 100, sell 0.4 @ 110 -> realize 0.4 * 10
        let d = apply_fill_math(dec(1.0), dec(100.0), Side::Sell, dec(0.4), dec(110.0));
        assert_eq!(d.new_quantity, dec(0.6));
        assert_eq!(d.new_entry_price, dec(100.0));
        assert_eq!(d.realized_pnl, dec(4.0));
        assert!(!d.crossed_zero);
    }

    #[test]
    fn test_full_close_resets_entry() {
        let d = apply_fill_math(dec(0.004), dec(90_000.0), Side::Sell, dec(0.004), dec(91_000.0));
        assert_eq!(d.new_quantity, Decimal::ZERO);
        assert_eq!(d.new_entry_price, Decimal::ZERO);
        assert_eq!(d.realized_pnl, dec(4.0));
    }

    #[test]
    fn test_short_close_pnl_sign() {
        // Short 1.0 @ 100, buy back 1.0 @ 90 -> profit 10
        let d = apply_fill_math(dec(-1.0), dec(100.0), Side::Buy, dec(1.0), dec(90.0));
        assert_eq!(d.new_quantity, Decimal::ZERO);
        assert_eq!(d.realized_pnl, dec(10.0));
    }

    #[test]
    fn test_zero_cross_splits() {
        // Long 1.0 @ 100, sell 1.5 @ 120: close 1.0 (+20), open short 0.5 @ 120
        let d = apply_fill_math(dec(1.0), dec(100.0), Side::Sell, dec(1.5), dec(120.0));
        assert_eq!(d.new_quantity, dec(-0.5));
        assert_eq!(d.new_entry_price, dec(120.0));
        assert_eq!(d.realized_pnl, dec(20.0));
        assert!(d.crossed_zero);
    }
}
