//! Domain entities and the order status machine
//!
//! Status and enum ids are designed for PostgreSQL storage as SMALLINT.
//! Every trade-side entity (Order, PendingOrder, Trade, Position) is
//! scoped by `strategy_account_id` - two strategies sharing one exchange
//! account never see each other's rows.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub type Id = i64;

// ============================================================================
// Market / exchange enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i16)]
pub enum MarketType {
    Spot = 0,
    Futures = 1,
    Stock = 2,
}

impl MarketType {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(MarketType::Spot),
            1 => Some(MarketType::Futures),
            2 => Some(MarketType::Stock),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MarketType::Spot => "SPOT",
            MarketType::Futures => "FUTURES",
            MarketType::Stock => "STOCK",
        }
    }
}

impl fmt::Display for MarketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i16)]
pub enum Exchange {
    Binance = 0,
    Bybit = 1,
    Upbit = 2,
    Bithumb = 3,
}

impl Exchange {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(Exchange::Binance),
            1 => Some(Exchange::Bybit),
            2 => Some(Exchange::Upbit),
            3 => Some(Exchange::Bithumb),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Binance => "binance",
            Exchange::Bybit => "bybit",
            Exchange::Upbit => "upbit",
            Exchange::Bithumb => "bithumb",
        }
    }

    /// Exchanges whose symbol rules come from rate-card rules instead of
    /// a market-info API.
    pub fn rule_driven_precision(&self) -> bool {
        matches!(self, Exchange::Upbit | Exchange::Bithumb)
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i16)]
pub enum Side {
    Buy = 0,
    Sell = 1,
}

impl Side {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(Side::Buy),
            1 => Some(Side::Sell),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i16)]
pub enum OrderType {
    Market = 0,
    Limit = 1,
    StopLimit = 2,
    StopMarket = 3,
}

impl OrderType {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(OrderType::Market),
            1 => Some(OrderType::Limit),
            2 => Some(OrderType::StopLimit),
            3 => Some(OrderType::StopMarket),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::StopLimit => "STOP_LIMIT",
            OrderType::StopMarket => "STOP_MARKET",
        }
    }

    /// STOP orders occupy the conditional-order sub-quota on each side.
    #[inline]
    pub fn is_stop(&self) -> bool {
        matches!(self, OrderType::StopLimit | OrderType::StopMarket)
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Order status machine
// ============================================================================

/// Order lifecycle states.
///
/// Terminal states: FILLED, CANCELLED, FAILED, EXPIRED, REJECTED.
/// PENDING and CANCELLING are local-only transients: the row exists in the
/// database but the exchange-side outcome is not yet known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i16)]
pub enum OrderStatus {
    /// Local row created; no exchange acknowledgement yet.
    Pending = 0,
    /// Exchange acknowledged, not yet resting on the book.
    New = 1,
    /// Resting at the exchange.
    Open = 2,
    PartiallyFilled = 3,
    /// Cancel requested; exchange outcome not yet known.
    Cancelling = 4,
    /// Terminal.
    Filled = 20,
    Cancelled = 21,
    Expired = 22,
    Rejected = 23,
    /// Terminal: the exchange call failed or the row was orphaned.
    Failed = -10,
}

impl OrderStatus {
    /// States background jobs iterate over.
    pub const ACTIVE: &'static [OrderStatus] = &[
        OrderStatus::Pending,
        OrderStatus::New,
        OrderStatus::Open,
        OrderStatus::PartiallyFilled,
        OrderStatus::Cancelling,
    ];

    /// States a dashboard shows. PENDING and CANCELLING are hidden.
    pub const UI_OPEN: &'static [OrderStatus] = &[
        OrderStatus::New,
        OrderStatus::Open,
        OrderStatus::PartiallyFilled,
    ];

    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(OrderStatus::Pending),
            1 => Some(OrderStatus::New),
            2 => Some(OrderStatus::Open),
            3 => Some(OrderStatus::PartiallyFilled),
            4 => Some(OrderStatus::Cancelling),
            20 => Some(OrderStatus::Filled),
            21 => Some(OrderStatus::Cancelled),
            22 => Some(OrderStatus::Expired),
            23 => Some(OrderStatus::Rejected),
            -10 => Some(OrderStatus::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::New => "NEW",
            OrderStatus::Open => "OPEN",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Cancelling => "CANCELLING",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Expired => "EXPIRED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Failed => "FAILED",
        }
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Cancelled
                | OrderStatus::Expired
                | OrderStatus::Rejected
                | OrderStatus::Failed
        )
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }

    #[inline]
    pub fn is_ui_open(&self) -> bool {
        Self::UI_OPEN.contains(self)
    }

    /// The normative transition table. All other transitions are bugs.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        match (self, next) {
            // Exchange acknowledgement
            (Pending, New) | (Pending, Open) => true,
            // Exchange call raised or returned a rejection
            (Pending, Failed) => true,
            (New, Open) => true,
            // Fills
            (New, PartiallyFilled) | (Open, PartiallyFilled) => true,
            (PartiallyFilled, PartiallyFilled) => true,
            (New, Filled) | (Open, Filled) | (PartiallyFilled, Filled) => true,
            // Cancel flow
            (New, Cancelling) | (Open, Cancelling) | (PartiallyFilled, Cancelling) => true,
            (Cancelling, Cancelled) => true,
            // Cancel failed; restore
            (Cancelling, Open) => true,
            // Exchange-side terminal outcomes from any non-terminal state
            (from, Expired) | (from, Rejected) if !from.is_terminal() => true,
            _ => false,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Entities
// ============================================================================

static GROUP_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,50}$").expect("group name regex"));

/// Validate a webhook routing key.
pub fn is_valid_group_name(name: &str) -> bool {
    GROUP_NAME_RE.is_match(name)
}

#[derive(Debug, Clone)]
pub struct User {
    pub user_id: Id,
    pub username: String,
    pub webhook_token: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Strategy {
    pub strategy_id: Id,
    pub owner_user_id: Id,
    /// Globally unique webhook routing key.
    pub group_name: String,
    pub market_type: MarketType,
    pub is_active: bool,
    pub is_public: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Account {
    pub account_id: Id,
    pub owner_user_id: Id,
    pub display_name: String,
    pub exchange: Exchange,
    pub market_type: MarketType,
    pub is_testnet: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The strategy-isolation key: the many-to-many edge between Strategy and
/// Account. Owns its orders, pending orders, trades and positions; deleting
/// it cascades to them.
#[derive(Debug, Clone)]
pub struct StrategyAccount {
    pub strategy_account_id: Id,
    pub strategy_id: Id,
    pub account_id: Id,
    /// Percent of account equity allocated to this strategy, [0.01, 100].
    pub weight: Decimal,
    /// [0.1, 125]
    pub leverage: Decimal,
    /// [1, 1000]
    pub max_symbols: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Generate the locally-unique placeholder stored in `exchange_order_id`
/// while the row is PENDING or CANCELLING.
pub fn pending_marker() -> String {
    format!("PENDING-{}", Uuid::new_v4())
}

/// True for markers produced by [`pending_marker`].
pub fn is_pending_marker(exchange_order_id: &str) -> bool {
    exchange_order_id.starts_with("PENDING-")
}

/// An order that is (or is about to be) outstanding at the exchange.
#[derive(Debug, Clone)]
pub struct Order {
    pub order_id: Id,
    pub strategy_account_id: Id,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub market_type: MarketType,
    pub status: OrderStatus,
    /// Real exchange id once OPEN; a `PENDING-<uuid>` marker before that.
    pub exchange_order_id: String,
    pub error_message: Option<String>,
    pub cancel_attempted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn remaining_quantity(&self) -> Decimal {
        self.quantity - self.filled_quantity
    }
}

/// Placement parameters shared by Order, PendingOrder and FailedOrder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementParams {
    pub strategy_account_id: Id,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub market_type: MarketType,
}

impl PlacementParams {
    /// Price/stop-price shape invariants per order type.
    pub fn validate_shape(&self) -> Result<(), String> {
        match self.order_type {
            OrderType::Market => {
                if self.price.is_some() {
                    return Err("MARKET orders carry no price".to_string());
                }
            }
            OrderType::Limit => {
                if self.price.is_none() {
                    return Err("LIMIT orders require a price".to_string());
                }
                if self.stop_price.is_some() {
                    return Err("LIMIT orders carry no stop price".to_string());
                }
            }
            OrderType::StopLimit => {
                if self.price.is_none() || self.stop_price.is_none() {
                    return Err("STOP_LIMIT orders require price and stop price".to_string());
                }
            }
            OrderType::StopMarket => {
                if self.stop_price.is_none() {
                    return Err("STOP_MARKET orders require a stop price".to_string());
                }
            }
        }
        if self.quantity <= Decimal::ZERO {
            return Err("quantity must be positive".to_string());
        }
        Ok(())
    }
}

/// Ranking key for the pending queue.
///
/// BUY LIMIT sorts by `+price`, SELL LIMIT by `-price`; STOP orders invert
/// (BUY STOP `-stop_price`, SELL STOP `+stop_price`). A single
/// `ORDER BY sort_price DESC` then yields highest-value-first within each
/// side: BUYs with higher bids win, SELLs with lower asks win.
pub fn sort_price(
    side: Side,
    order_type: OrderType,
    price: Option<Decimal>,
    stop_price: Option<Decimal>,
) -> Decimal {
    let limit_px = price.unwrap_or(Decimal::ZERO);
    let stop_px = stop_price.unwrap_or(Decimal::ZERO);
    match (side, order_type.is_stop()) {
        (Side::Buy, false) => limit_px,
        (Side::Sell, false) => -limit_px,
        (Side::Buy, true) => -stop_px,
        (Side::Sell, true) => stop_px,
    }
}

/// An order waiting in the local queue, not yet sent to the exchange.
#[derive(Debug, Clone)]
pub struct PendingOrder {
    pub pending_order_id: Id,
    pub strategy_account_id: Id,
    pub account_id: Id,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub market_type: MarketType,
    /// Smaller = higher priority.
    pub priority: i32,
    pub sort_price: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PendingOrder {
    pub fn placement(&self) -> PlacementParams {
        PlacementParams {
            strategy_account_id: self.strategy_account_id,
            symbol: self.symbol.clone(),
            side: self.side,
            order_type: self.order_type,
            quantity: self.quantity,
            price: self.price,
            stop_price: self.stop_price,
            market_type: self.market_type,
        }
    }
}

/// Failed-order status (user-facing retry queue)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i16)]
pub enum FailedOrderStatus {
    PendingRetry = 0,
    Removed = 1,
}

impl FailedOrderStatus {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(FailedOrderStatus::PendingRetry),
            1 => Some(FailedOrderStatus::Removed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailedOrderStatus::PendingRetry => "pending_retry",
            FailedOrderStatus::Removed => "removed",
        }
    }
}

/// Post-mortem for an exchange-rejected order. Kept for the user to
/// inspect and retry.
#[derive(Debug, Clone)]
pub struct FailedOrder {
    pub failed_order_id: Id,
    pub strategy_account_id: Id,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    /// Short classification, <= 100 chars.
    pub reason: String,
    /// Sanitized exchange error, <= 500 chars.
    pub exchange_error: Option<String>,
    /// Full placement params snapshot for retry.
    pub params_json: serde_json::Value,
    pub status: FailedOrderStatus,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One per completed order.
#[derive(Debug, Clone)]
pub struct Trade {
    pub trade_id: Id,
    pub strategy_account_id: Id,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub avg_price: Decimal,
    pub commission: Decimal,
    pub realized_pnl: Decimal,
    pub exchange_order_id: String,
    pub created_at: DateTime<Utc>,
}

/// One per fill, unique by `exchange_trade_id`.
#[derive(Debug, Clone)]
pub struct TradeExecution {
    pub execution_id: Id,
    pub strategy_account_id: Id,
    pub exchange_trade_id: String,
    pub exchange_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub price: Decimal,
    pub quantity: Decimal,
    pub commission: Decimal,
    pub commission_asset: Option<String>,
    pub is_maker: bool,
    pub realized_pnl: Decimal,
    pub created_at: DateTime<Utc>,
}

/// Per (strategy_account, symbol). `quantity` is signed: positive long,
/// negative short.
#[derive(Debug, Clone)]
pub struct Position {
    pub position_id: Id,
    pub strategy_account_id: Id,
    pub symbol: String,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn is_flat(&self) -> bool {
        self.quantity.is_zero()
    }

    pub fn is_long(&self) -> bool {
        self.quantity > Decimal::ZERO
    }

    pub fn is_short(&self) -> bool {
        self.quantity < Decimal::ZERO
    }
}

// ============================================================================
// Symbol canonicalization
// ============================================================================

/// Canonicalize a webhook symbol to `BASE/QUOTE`.
///
/// Accepts `BTC/USDT`, `BTC-USDT`, `KRW-BTC` (Upbit native, quote first)
/// and plain `BTCUSDT` against a known-quote suffix list.
pub fn canonicalize_symbol(raw: &str) -> Option<String> {
    const KNOWN_QUOTES: &[&str] = &["USDT", "USDC", "BTC", "ETH", "KRW", "USD"];

    let s = raw.trim().to_ascii_uppercase();
    if s.is_empty() {
        return None;
    }

    if let Some((base, quote)) = s.split_once('/') {
        if base.is_empty() || quote.is_empty() {
            return None;
        }
        return Some(format!("{}/{}", base, quote));
    }

    if let Some((first, second)) = s.split_once('-') {
        if first.is_empty() || second.is_empty() {
            return None;
        }
        // Upbit writes the quote currency first: KRW-BTC means BTC/KRW.
        if first == "KRW" {
            return Some(format!("{}/{}", second, first));
        }
        return Some(format!("{}/{}", first, second));
    }

    for quote in KNOWN_QUOTES {
        if s.len() > quote.len() && s.ends_with(quote) {
            let base = &s[..s.len() - quote.len()];
            return Some(format!("{}/{}", base, quote));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::prelude::FromPrimitive;

    fn dec(v: f64) -> Decimal {
        Decimal::from_f64(v).unwrap()
    }

    #[test]
    fn test_terminal_states() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Failed.is_terminal());
        assert!(OrderStatus::Expired.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());

        assert!(!OrderStatus::Pending.is_terminal());
        assert!(!OrderStatus::Cancelling.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }

    #[test]
    fn test_status_groups() {
        assert!(OrderStatus::Pending.is_active());
        assert!(OrderStatus::Cancelling.is_active());
        assert!(!OrderStatus::Filled.is_active());

        assert!(OrderStatus::Open.is_ui_open());
        assert!(!OrderStatus::Pending.is_ui_open());
        assert!(!OrderStatus::Cancelling.is_ui_open());
    }

    #[test]
    fn test_status_id_roundtrip() {
        for status in [
            OrderStatus::Pending,
            OrderStatus::New,
            OrderStatus::Open,
            OrderStatus::PartiallyFilled,
            OrderStatus::Cancelling,
            OrderStatus::Filled,
            OrderStatus::Cancelled,
            OrderStatus::Expired,
            OrderStatus::Rejected,
            OrderStatus::Failed,
        ] {
            assert_eq!(OrderStatus::from_id(status.id()), Some(status));
        }
        assert_eq!(OrderStatus::from_id(999), None);
    }

    #[test]
    fn test_transition_table() {
        use OrderStatus::*;
        assert!(Pending.can_transition_to(Open));
        assert!(Pending.can_transition_to(Failed));
        assert!(Open.can_transition_to(PartiallyFilled));
        assert!(PartiallyFilled.can_transition_to(Filled));
        assert!(Open.can_transition_to(Cancelling));
        assert!(Cancelling.can_transition_to(Cancelled));
        assert!(Cancelling.can_transition_to(Open));
        assert!(Open.can_transition_to(Expired));
        assert!(PartiallyFilled.can_transition_to(Rejected));

        // Illegal moves
        assert!(!Filled.can_transition_to(Open));
        assert!(!Cancelled.can_transition_to(Cancelling));
        assert!(!Pending.can_transition_to(Filled));
        assert!(!Pending.can_transition_to(Cancelling));
        assert!(!Open.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Expired));
    }

    #[test]
    fn test_sort_price_rule() {
        // BUY LIMIT: higher bid ranks first under ORDER BY sort_price DESC
        assert!(
            sort_price(Side::Buy, OrderType::Limit, Some(dec(100.0)), None)
                > sort_price(Side::Buy, OrderType::Limit, Some(dec(99.0)), None)
        );
        // SELL LIMIT: lower ask ranks first
        assert!(
            sort_price(Side::Sell, OrderType::Limit, Some(dec(99.0)), None)
                > sort_price(Side::Sell, OrderType::Limit, Some(dec(100.0)), None)
        );
        // BUY STOP: lower trigger ranks first
        assert!(
            sort_price(Side::Buy, OrderType::StopMarket, None, Some(dec(95.0)))
                > sort_price(Side::Buy, OrderType::StopMarket, None, Some(dec(96.0)))
        );
        // SELL STOP: higher trigger ranks first
        assert!(
            sort_price(Side::Sell, OrderType::StopLimit, Some(dec(90.0)), Some(dec(96.0)))
                > sort_price(Side::Sell, OrderType::StopLimit, Some(dec(90.0)), Some(dec(95.0)))
        );
    }

    #[test]
    fn test_group_name_validation() {
        assert!(is_valid_group_name("my-strategy_1"));
        assert!(is_valid_group_name("A"));
        assert!(!is_valid_group_name(""));
        assert!(!is_valid_group_name("has space"));
        assert!(!is_valid_group_name("slash/name"));
        assert!(!is_valid_group_name(&"x".repeat(51)));
    }

    #[test]
    fn test_pending_marker() {
        let m = pending_marker();
        assert!(is_pending_marker(&m));
        assert_ne!(m, pending_marker());
        assert!(!is_pending_marker("1234567890"));
    }

    #[test]
    fn test_placement_shape() {
        let mut p = PlacementParams {
            strategy_account_id: 1,
            symbol: "BTC/USDT".to_string(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            quantity: dec(1.0),
            price: Some(dec(100.0)),
            stop_price: None,
            market_type: MarketType::Spot,
        };
        assert!(p.validate_shape().is_ok());

        p.price = None;
        assert!(p.validate_shape().is_err());

        p.order_type = OrderType::Market;
        assert!(p.validate_shape().is_ok());
        p.price = Some(dec(100.0));
        assert!(p.validate_shape().is_err());

        p.order_type = OrderType::StopLimit;
        p.stop_price = None;
        assert!(p.validate_shape().is_err());
        p.stop_price = Some(dec(99.0));
        assert!(p.validate_shape().is_ok());
    }

    #[test]
    fn test_canonicalize_symbol() {
        assert_eq!(canonicalize_symbol("btc/usdt").as_deref(), Some("BTC/USDT"));
        assert_eq!(canonicalize_symbol("BTC-USDT").as_deref(), Some("BTC/USDT"));
        assert_eq!(canonicalize_symbol("KRW-BTC").as_deref(), Some("BTC/KRW"));
        assert_eq!(canonicalize_symbol("BTCUSDT").as_deref(), Some("BTC/USDT"));
        assert_eq!(canonicalize_symbol("ethbtc").as_deref(), Some("ETH/BTC"));
        assert_eq!(canonicalize_symbol(""), None);
        assert_eq!(canonicalize_symbol("???"), None);
    }
}
