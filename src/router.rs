//! Webhook signal routing
//!
//! Each gate is hard: normalize, resolve the strategy, check the token,
//! validate params per order type, then split batches into the HIGH
//! (immediate) and LOW (conditional) priority classes. A request is a
//! batch iff the body carries the `orders` key; no derived flag exists.

use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;

use crate::db::{Database, DbError, StrategyRepo};
use crate::models::{canonicalize_symbol, OrderType, Side, Strategy};

// ============================================================================
// Wire shapes
// ============================================================================

/// One intent as it appears on the wire (flat body or an `orders` item).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawIntent {
    pub symbol: Option<String>,
    pub side: Option<String>,
    pub order_type: Option<String>,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub qty_per: Option<Decimal>,
}

/// Full webhook body. Single intents inline their fields; batches carry
/// them under `orders`.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    pub group_name: Option<String>,
    pub token: Option<String>,
    #[serde(flatten)]
    pub intent: RawIntent,
    pub orders: Option<Vec<RawIntent>>,
}

// ============================================================================
// Routed output
// ============================================================================

/// What an intent asks the orchestrator to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentAction {
    Place(OrderType),
    /// Cancel open orders on one symbol.
    Cancel,
    /// Cancel everything under the subscription.
    CancelAll,
}

/// HIGH executes promptly (market impact); LOW is conditional resting
/// orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityClass {
    High,
    Low,
}

#[derive(Debug, Clone)]
pub struct SignalIntent {
    pub action: IntentAction,
    /// Canonical `BASE/QUOTE`; empty only for CancelAll.
    pub symbol: String,
    pub side: Option<Side>,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub qty_per: Decimal,
    pub priority: PriorityClass,
}

#[derive(Debug)]
pub struct RoutedSignal {
    pub strategy: Strategy,
    /// True iff the body carried the `orders` key.
    pub is_batch: bool,
    pub high: Vec<SignalIntent>,
    pub low: Vec<SignalIntent>,
}

impl RoutedSignal {
    pub fn intent_count(&self) -> usize {
        self.high.len() + self.low.len()
    }
}

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Strategy not found: {0}")]
    StrategyNotFound(String),

    #[error("Strategy is not active: {0}")]
    StrategyInactive(String),

    #[error("Invalid webhook token")]
    AuthFailed,

    #[error("Batch too large: {0} orders (max {1})")]
    BatchTooLarge(usize, usize),

    #[error(transparent)]
    Db(#[from] DbError),
}

// ============================================================================
// Normalization (pure)
// ============================================================================

fn normalize_side(raw: &str) -> Result<Side, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "buy" => Ok(Side::Buy),
        "sell" => Ok(Side::Sell),
        other => Err(format!("unknown side '{}'", other)),
    }
}

/// Normalize and validate one raw intent. The parameter table:
///
/// | type            | price     | stop_price |
/// |-----------------|-----------|------------|
/// | LIMIT           | required  | forbidden  |
/// | STOP_LIMIT/MKT  | required  | required   |
/// | MARKET          | optional  | dropped    |
/// | CANCEL(_ALL)    | n/a       | n/a        |
pub fn normalize_intent(raw: &RawIntent) -> Result<SignalIntent, String> {
    let order_type_raw = raw
        .order_type
        .as_deref()
        .map(|s| s.trim().to_ascii_uppercase())
        .ok_or_else(|| "order_type is required".to_string())?;

    let symbol = || -> Result<String, String> {
        let raw_symbol = raw
            .symbol
            .as_deref()
            .ok_or_else(|| "symbol is required".to_string())?;
        canonicalize_symbol(raw_symbol)
            .ok_or_else(|| format!("unrecognized symbol '{}'", raw_symbol))
    };

    match order_type_raw.as_str() {
        "CANCEL_ALL_ORDER" => {
            return Ok(SignalIntent {
                action: IntentAction::CancelAll,
                symbol: raw
                    .symbol
                    .as_deref()
                    .and_then(canonicalize_symbol)
                    .unwrap_or_default(),
                side: None,
                price: None,
                stop_price: None,
                qty_per: Decimal::ZERO,
                priority: PriorityClass::High,
            });
        }
        "CANCEL" => {
            return Ok(SignalIntent {
                action: IntentAction::Cancel,
                symbol: symbol()?,
                side: None,
                price: None,
                stop_price: None,
                qty_per: Decimal::ZERO,
                priority: PriorityClass::High,
            });
        }
        _ => {}
    }

    let order_type = match order_type_raw.as_str() {
        "MARKET" => OrderType::Market,
        "LIMIT" => OrderType::Limit,
        "STOP_LIMIT" => OrderType::StopLimit,
        "STOP_MARKET" => OrderType::StopMarket,
        other => return Err(format!("unknown order_type '{}'", other)),
    };

    let side = normalize_side(
        raw.side
            .as_deref()
            .ok_or_else(|| "side is required".to_string())?,
    )?;

    let mut price = raw.price;
    let mut stop_price = raw.stop_price;
    match order_type {
        OrderType::Limit => {
            if price.is_none() {
                return Err("LIMIT requires price".to_string());
            }
            if stop_price.is_some() {
                return Err("LIMIT forbids stop_price".to_string());
            }
        }
        OrderType::StopLimit | OrderType::StopMarket => {
            if price.is_none() {
                return Err(format!("{} requires price", order_type));
            }
            if stop_price.is_none() {
                return Err(format!("{} requires stop_price", order_type));
            }
        }
        OrderType::Market => {
            // Price, when present, is kept for sizing only.
            if stop_price.is_some() {
                tracing::warn!("MARKET intent carried stop_price; dropped");
                stop_price = None;
            }
        }
    }
    if let Some(p) = price {
        if p <= Decimal::ZERO {
            return Err("price must be positive".to_string());
        }
    }
    if let Some(p) = stop_price {
        if p <= Decimal::ZERO {
            return Err("stop_price must be positive".to_string());
        }
    }

    let qty_per = raw
        .qty_per
        .ok_or_else(|| "qty_per is required".to_string())?;
    if qty_per.is_zero() || qty_per > Decimal::new(100, 0) || qty_per < Decimal::new(-100, 0) {
        return Err(format!("qty_per {} out of range", qty_per));
    }

    // A stop-market placement carries no limit price at the exchange;
    // the validated price is kept for sizing only.
    if order_type == OrderType::StopMarket {
        price = None;
    }

    let priority = match order_type {
        OrderType::Market => PriorityClass::High,
        _ => PriorityClass::Low,
    };

    Ok(SignalIntent {
        action: IntentAction::Place(order_type),
        symbol: symbol()?,
        side: Some(side),
        price,
        stop_price,
        qty_per,
        priority,
    })
}

// ============================================================================
// The router
// ============================================================================

pub struct SignalRouter {
    db: Database,
    max_batch: usize,
}

impl SignalRouter {
    pub fn new(db: Database, max_batch: usize) -> Self {
        Self { db, max_batch }
    }

    pub async fn route(&self, payload: &WebhookPayload) -> Result<RoutedSignal, RouterError> {
        let group_name = payload
            .group_name
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| RouterError::InvalidInput("group_name is required".to_string()))?;
        let token = payload
            .token
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| RouterError::InvalidInput("token is required".to_string()))?;

        let strategy = StrategyRepo::find_by_group_name(&self.db, group_name)
            .await?
            .ok_or_else(|| RouterError::StrategyNotFound(group_name.to_string()))?;
        if !strategy.is_active {
            return Err(RouterError::StrategyInactive(group_name.to_string()));
        }

        let valid_tokens = StrategyRepo::valid_webhook_tokens(&self.db, &strategy).await?;
        if !valid_tokens.iter().any(|t| t == token) {
            return Err(RouterError::AuthFailed);
        }

        // Batch detection: the presence of the `orders` key, nothing else.
        let is_batch = payload.orders.is_some();
        let raw_intents: Vec<&RawIntent> = match &payload.orders {
            Some(orders) => orders.iter().collect(),
            None => vec![&payload.intent],
        };
        if raw_intents.len() > self.max_batch {
            return Err(RouterError::BatchTooLarge(raw_intents.len(), self.max_batch));
        }
        if raw_intents.is_empty() {
            return Err(RouterError::InvalidInput("empty batch".to_string()));
        }

        // Array order survives inside each class.
        let mut high = Vec::new();
        let mut low = Vec::new();
        for (index, raw) in raw_intents.iter().enumerate() {
            let intent = normalize_intent(raw)
                .map_err(|e| RouterError::InvalidInput(format!("order[{}]: {}", index, e)))?;
            match intent.priority {
                PriorityClass::High => high.push(intent),
                PriorityClass::Low => low.push(intent),
            }
        }

        Ok(RoutedSignal {
            strategy,
            is_batch,
            high,
            low,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(order_type: &str) -> RawIntent {
        RawIntent {
            symbol: Some("btc/usdt".to_string()),
            side: Some("buy".to_string()),
            order_type: Some(order_type.to_string()),
            price: Some(Decimal::new(90_000, 0)),
            stop_price: None,
            qty_per: Some(Decimal::new(5, 0)),
        }
    }

    #[test]
    fn test_limit_normalization() {
        let intent = normalize_intent(&raw("limit")).unwrap();
        assert_eq!(intent.action, IntentAction::Place(OrderType::Limit));
        assert_eq!(intent.symbol, "BTC/USDT");
        assert_eq!(intent.side, Some(Side::Buy));
        assert_eq!(intent.priority, PriorityClass::Low);
    }

    #[test]
    fn test_limit_requires_price_forbids_stop() {
        let mut r = raw("LIMIT");
        r.price = None;
        assert!(normalize_intent(&r).is_err());

        let mut r = raw("LIMIT");
        r.stop_price = Some(Decimal::new(89_000, 0));
        assert!(normalize_intent(&r).is_err());
    }

    #[test]
    fn test_market_drops_stop_price_keeps_price() {
        let mut r = raw("MARKET");
        r.stop_price = Some(Decimal::new(89_000, 0));
        let intent = normalize_intent(&r).unwrap();
        assert_eq!(intent.stop_price, None);
        // Price survives for sizing.
        assert_eq!(intent.price, Some(Decimal::new(90_000, 0)));
        assert_eq!(intent.priority, PriorityClass::High);
    }

    #[test]
    fn test_stop_limit_requires_both() {
        let mut r = raw("STOP_LIMIT");
        assert!(normalize_intent(&r).is_err()); // missing stop_price
        r.stop_price = Some(Decimal::new(89_500, 0));
        let intent = normalize_intent(&r).unwrap();
        assert_eq!(intent.action, IntentAction::Place(OrderType::StopLimit));
        assert_eq!(intent.priority, PriorityClass::Low);
    }

    #[test]
    fn test_stop_market_price_used_for_sizing_only() {
        let mut r = raw("STOP_MARKET");
        r.stop_price = Some(Decimal::new(89_500, 0));
        let intent = normalize_intent(&r).unwrap();
        // Validated but not placed as a limit price.
        assert_eq!(intent.price, None);
        assert_eq!(intent.stop_price, Some(Decimal::new(89_500, 0)));
    }

    #[test]
    fn test_cancel_actions() {
        let mut r = raw("CANCEL");
        r.side = None;
        r.qty_per = None;
        let intent = normalize_intent(&r).unwrap();
        assert_eq!(intent.action, IntentAction::Cancel);
        assert_eq!(intent.priority, PriorityClass::High);

        let mut r = raw("cancel_all_order");
        r.symbol = None;
        r.side = None;
        r.qty_per = None;
        let intent = normalize_intent(&r).unwrap();
        assert_eq!(intent.action, IntentAction::CancelAll);
        assert!(intent.symbol.is_empty());
    }

    #[test]
    fn test_side_mapping() {
        let mut r = raw("LIMIT");
        r.side = Some("SELL".to_string());
        assert_eq!(normalize_intent(&r).unwrap().side, Some(Side::Sell));
        r.side = Some("hold".to_string());
        assert!(normalize_intent(&r).is_err());
    }

    #[test]
    fn test_qty_per_range() {
        let mut r = raw("MARKET");
        r.qty_per = Some(Decimal::new(-100, 0));
        assert!(normalize_intent(&r).is_ok());
        r.qty_per = Some(Decimal::new(-101, 0));
        assert!(normalize_intent(&r).is_err());
        r.qty_per = Some(Decimal::ZERO);
        assert!(normalize_intent(&r).is_err());
        r.qty_per = Some(Decimal::new(101, 0));
        assert!(normalize_intent(&r).is_err());
    }

    #[test]
    fn test_unknown_order_type() {
        assert!(normalize_intent(&raw("ICEBERG")).is_err());
    }
}
