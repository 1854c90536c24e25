//! Quantity sizing
//!
//! Positive `qty_per` sizes a fraction of the subscription's allocated
//! capital; negative values close (part of) an existing position. All
//! quantities snap DOWN to the symbol step before the boundary checks,
//! so an accepted size always passes the exchange filters.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::exchange::SymbolRules;
use crate::models::{Position, Side};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SizingError {
    #[error("qty_per must be in (-100, 0) or (0, 100], got {0}")]
    InvalidQtyPer(Decimal),

    #[error("No reference price available for sizing")]
    MissingPrice,

    #[error("No position in the required direction to close")]
    NoPosition,

    #[error("Sized quantity rejected: {0}")]
    BelowMinimum(String),
}

/// Everything the sizer needs, resolved by the orchestrator.
#[derive(Debug, Clone)]
pub struct SizingInput<'a> {
    /// Percent of allocated capital (positive) or of the open position
    /// (negative, magnitude <= 100).
    pub qty_per: Decimal,
    pub side: Side,
    /// Webhook-provided price, if any.
    pub signal_price: Option<Decimal>,
    /// Last cached trade price, the MARKET fallback.
    pub cached_price: Option<Decimal>,
    /// Account equity x weight% x leverage.
    pub allocated_capital: Decimal,
    pub rules: &'a SymbolRules,
    pub position: Option<&'a Position>,
}

/// Compute the order quantity for an intent.
pub fn size_order(input: &SizingInput<'_>) -> Result<Decimal, SizingError> {
    let hundred = Decimal::new(100, 0);

    if input.qty_per > Decimal::ZERO {
        if input.qty_per > hundred {
            return Err(SizingError::InvalidQtyPer(input.qty_per));
        }
        // Webhook price first, price cache second.
        let reference = input
            .signal_price
            .or(input.cached_price)
            .filter(|p| !p.is_zero())
            .ok_or(SizingError::MissingPrice)?;

        let notional = input.allocated_capital * input.qty_per / hundred;
        let raw = notional / reference;
        let snapped = input.rules.snap_qty(raw);
        input
            .rules
            .check_qty(snapped, reference)
            .map_err(SizingError::BelowMinimum)?;
        return Ok(snapped);
    }

    if input.qty_per.is_zero() || input.qty_per < -hundred {
        return Err(SizingError::InvalidQtyPer(input.qty_per));
    }

    // Negative: close against the existing position. A SELL closes a
    // long, a BUY closes a short.
    let position = input.position.ok_or(SizingError::NoPosition)?;
    let closable = match input.side {
        Side::Sell if position.is_long() => position.quantity,
        Side::Buy if position.is_short() => -position.quantity,
        _ => return Err(SizingError::NoPosition),
    };

    let fraction = input.qty_per.abs() / hundred;
    let raw = closable * fraction;
    let snapped = input.rules.snap_qty(raw);
    if snapped <= Decimal::ZERO {
        return Err(SizingError::BelowMinimum(format!(
            "close quantity {} snaps to zero at step {}",
            raw, input.rules.step_size
        )));
    }
    // Closes skip the notional floor: reducing an open position must
    // always be possible.
    Ok(snapped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal::prelude::FromPrimitive;

    fn dec(v: f64) -> Decimal {
        Decimal::from_f64(v).unwrap()
    }

    fn rules() -> SymbolRules {
        SymbolRules {
            min_qty: dec(0.0001),
            max_qty: dec(1000.0),
            step_size: dec(0.001),
            min_price: dec(0.01),
            max_price: dec(1_000_000.0),
            tick_size: dec(0.01),
            min_notional: dec(5.0),
        }
    }

    fn long_position(qty: f64) -> Position {
        Position {
            position_id: 1,
            strategy_account_id: 1,
            symbol: "BTC/USDT".to_string(),
            quantity: dec(qty),
            entry_price: dec(90_000.0),
            mark_price: dec(90_000.0),
            unrealized_pnl: Decimal::ZERO,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_percent_of_capital() {
        // $10,000 x 5% / 90,000 = 0.00555.. -> 0.005 at step 0.001
        let r = rules();
        let input = SizingInput {
            qty_per: dec(5.0),
            side: Side::Buy,
            signal_price: Some(dec(90_000.0)),
            cached_price: None,
            allocated_capital: dec(10_000.0),
            rules: &r,
            position: None,
        };
        assert_eq!(size_order(&input).unwrap(), dec(0.005));
    }

    #[test]
    fn test_cached_price_fallback() {
        let r = rules();
        let input = SizingInput {
            qty_per: dec(5.0),
            side: Side::Buy,
            signal_price: None,
            cached_price: Some(dec(100_000.0)),
            allocated_capital: dec(10_000.0),
            rules: &r,
            position: None,
        };
        assert_eq!(size_order(&input).unwrap(), dec(0.005));

        let no_price = SizingInput {
            cached_price: None,
            ..input
        };
        assert_eq!(size_order(&no_price), Err(SizingError::MissingPrice));
    }

    #[test]
    fn test_min_notional_rejection() {
        let r = rules();
        let input = SizingInput {
            qty_per: dec(0.001),
            side: Side::Buy,
            signal_price: Some(dec(90_000.0)),
            cached_price: None,
            allocated_capital: dec(10_000.0),
            rules: &r,
            position: None,
        };
        assert!(matches!(
            size_order(&input),
            Err(SizingError::BelowMinimum(_))
        ));
    }

    #[test]
    fn test_full_close() {
        let r = rules();
        let pos = long_position(0.004);
        let input = SizingInput {
            qty_per: dec(-100.0),
            side: Side::Sell,
            signal_price: None,
            cached_price: None,
            allocated_capital: dec(10_000.0),
            rules: &r,
            position: Some(&pos),
        };
        assert_eq!(size_order(&input).unwrap(), dec(0.004));
    }

    #[test]
    fn test_close_requires_opposite_direction() {
        let r = rules();
        let pos = long_position(0.004);
        // BUY cannot close a long.
        let input = SizingInput {
            qty_per: dec(-100.0),
            side: Side::Buy,
            signal_price: None,
            cached_price: None,
            allocated_capital: dec(10_000.0),
            rules: &r,
            position: Some(&pos),
        };
        assert_eq!(size_order(&input), Err(SizingError::NoPosition));

        // No position at all.
        let input = SizingInput {
            side: Side::Sell,
            position: None,
            ..input
        };
        assert_eq!(size_order(&input), Err(SizingError::NoPosition));
    }

    #[test]
    fn test_partial_close_fraction() {
        let r = rules();
        let pos = long_position(0.01);
        let input = SizingInput {
            qty_per: dec(-50.0),
            side: Side::Sell,
            signal_price: None,
            cached_price: None,
            allocated_capital: dec(10_000.0),
            rules: &r,
            position: Some(&pos),
        };
        assert_eq!(size_order(&input).unwrap(), dec(0.005));
    }

    #[test]
    fn test_invalid_qty_per() {
        let r = rules();
        let base = SizingInput {
            qty_per: Decimal::ZERO,
            side: Side::Buy,
            signal_price: Some(dec(90_000.0)),
            cached_price: None,
            allocated_capital: dec(10_000.0),
            rules: &r,
            position: None,
        };
        assert!(matches!(
            size_order(&base),
            Err(SizingError::InvalidQtyPer(_))
        ));
        let over = SizingInput {
            qty_per: dec(150.0),
            ..base.clone()
        };
        assert!(matches!(
            size_order(&over),
            Err(SizingError::InvalidQtyPer(_))
        ));
        let under = SizingInput {
            qty_per: dec(-150.0),
            ..base
        };
        assert!(matches!(
            size_order(&under),
            Err(SizingError::InvalidQtyPer(_))
        ));
    }
}
