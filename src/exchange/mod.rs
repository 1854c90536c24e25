//! Exchange integration
//!
//! One adapter per (exchange, market type); all of them speak the single
//! [`ExchangeAdapter`] interface over canonical types, so nothing above
//! this module ever branches on a concrete exchange. New exchanges are
//! added by registering a factory with [`AdapterRegistry`].

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::models::{Account, Exchange, Id, MarketType, OrderStatus, OrderType, Side};
use crate::secrets::{SecretError, SecretStore};

pub mod catalog;
pub mod rate_limit;
pub mod stream;

pub mod binance;
pub mod bybit;
pub mod upbit;

// [SECURITY] In-memory mock adapter - only compiled when the
// 'mock-exchange' feature is enabled. Production builds MUST be compiled
// with `--no-default-features` to exclude this.
#[cfg(any(test, feature = "mock-exchange"))]
pub mod mock;

pub use catalog::{MarketCatalog, SymbolRules};
pub use rate_limit::{EndpointClass, RateLimiters};
pub use stream::UserStreamManager;

// ============================================================================
// Errors
// ============================================================================

/// Canonical exchange error classes. Adapters translate every native
/// error shape into one of these.
#[derive(Error, Debug, Clone)]
pub enum ExchangeError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    #[error("Rate limited: {0}")]
    RateLimit(String),

    #[error("Exchange error: {0}")]
    Exchange(String),
}

impl ExchangeError {
    /// Transient errors are retried with backoff; the rest are final.
    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::Network(_) | ExchangeError::RateLimit(_))
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            ExchangeError::Network(e.to_string())
        } else {
            ExchangeError::Exchange(e.to_string())
        }
    }
}

impl From<SecretError> for ExchangeError {
    fn from(e: SecretError) -> Self {
        ExchangeError::Auth(e.to_string())
    }
}

// ============================================================================
// Canonical wire types
// ============================================================================

/// Canonical placement request. `symbol` is `BASE/QUOTE`; adapters
/// convert to the native form at the wire.
#[derive(Debug, Clone)]
pub struct PlaceOrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub market_type: MarketType,
}

/// Exchange acknowledgement of a placement.
#[derive(Debug, Clone)]
pub struct ExchangeOrderAck {
    pub exchange_order_id: String,
    pub status: OrderStatus,
}

/// Normalized exchange-side order snapshot.
#[derive(Debug, Clone)]
pub struct ExchangeOrder {
    pub exchange_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    pub price: Option<Decimal>,
    pub avg_price: Option<Decimal>,
}

#[derive(Debug, Clone)]
pub struct AssetBalance {
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
}

#[derive(Debug, Clone)]
pub struct ExchangePosition {
    pub symbol: String,
    /// Signed: positive long, negative short.
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub unrealized_pnl: Decimal,
}

#[derive(Debug, Clone)]
pub struct Ticker {
    pub symbol: String,
    pub last: Decimal,
}

/// One fill carried by a user-stream order update.
#[derive(Debug, Clone)]
pub struct FillData {
    pub exchange_trade_id: String,
    pub price: Decimal,
    pub quantity: Decimal,
    pub commission: Decimal,
    pub commission_asset: Option<String>,
    pub is_maker: bool,
}

/// Normalized user-data stream order update.
#[derive(Debug, Clone)]
pub struct OrderUpdate {
    pub exchange_order_id: String,
    pub symbol: String,
    pub status: OrderStatus,
    pub filled_quantity: Decimal,
    pub fill: Option<FillData>,
}

/// Events surfaced by an adapter's user-data stream.
#[derive(Debug, Clone)]
pub enum UserStreamEvent {
    Order(OrderUpdate),
    /// The connection dropped; the stream manager decides on reconnect.
    Disconnected { reason: String },
}

// ============================================================================
// Per-exchange order-count ceilings
// ============================================================================

/// Open-order ceilings the queue scheduler plans against.
#[derive(Debug, Clone, Copy)]
pub struct ExchangeLimits {
    /// Maximum resting orders per side of one symbol.
    pub max_per_side: usize,
    /// Exchange cap on conditional (stop) orders per side.
    pub conditional_cap: usize,
}

impl ExchangeLimits {
    pub fn for_market(exchange: Exchange, market_type: MarketType) -> Self {
        match (exchange, market_type) {
            (Exchange::Binance, MarketType::Spot) => Self { max_per_side: 20, conditional_cap: 5 },
            (Exchange::Binance, _) => Self { max_per_side: 25, conditional_cap: 10 },
            (Exchange::Bybit, MarketType::Spot) => Self { max_per_side: 30, conditional_cap: 10 },
            (Exchange::Bybit, _) => Self { max_per_side: 50, conditional_cap: 10 },
            (Exchange::Upbit, _) => Self { max_per_side: 15, conditional_cap: 4 },
            (Exchange::Bithumb, _) => Self { max_per_side: 10, conditional_cap: 3 },
        }
    }

    /// STOP orders may occupy at most ~`ratio` of each side's slots, but
    /// the ceil keeps at least one slot available. For `max_per_side = 2`
    /// this intentionally yields 1 (50%); the at-least-1 guarantee wins
    /// over the ratio target.
    pub fn max_stop_per_side(&self, ratio: f64) -> usize {
        let by_ratio = (self.max_per_side as f64 * ratio).ceil() as usize;
        by_ratio.min(self.conditional_cap).min(self.max_per_side)
    }
}

// ============================================================================
// The adapter interface
// ============================================================================

#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn exchange(&self) -> Exchange;

    async fn create_order(&self, req: &PlaceOrderRequest)
        -> Result<ExchangeOrderAck, ExchangeError>;

    async fn cancel_order(&self, symbol: &str, exchange_order_id: &str)
        -> Result<(), ExchangeError>;

    async fn fetch_order(
        &self,
        symbol: &str,
        exchange_order_id: &str,
    ) -> Result<ExchangeOrder, ExchangeError>;

    async fn fetch_open_orders(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<ExchangeOrder>, ExchangeError>;

    async fn fetch_balance(&self) -> Result<Vec<AssetBalance>, ExchangeError>;

    async fn fetch_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError>;

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError>;

    /// Per-symbol trading rules, canonical symbol keys.
    async fn load_markets(&self) -> Result<Vec<(String, SymbolRules)>, ExchangeError>;

    /// Open the user-data stream. The adapter owns the socket; normalized
    /// events arrive on the returned channel until it closes.
    async fn connect_user_stream(
        &self,
    ) -> Result<mpsc::Receiver<UserStreamEvent>, ExchangeError>;

    /// Refresh listen-keys/tokens. Called every ~30 minutes, at most half
    /// of the shortest exchange-side expiry.
    async fn keepalive_user_stream(&self) -> Result<(), ExchangeError> {
        Ok(())
    }
}

// ============================================================================
// Registry
// ============================================================================

pub type AdapterFactory = Arc<
    dyn Fn(&Account, crate::secrets::ApiCredentials) -> Result<Arc<dyn ExchangeAdapter>, ExchangeError>
        + Send
        + Sync,
>;

/// Maps (exchange, market type) to an adapter factory and caches one
/// adapter instance per account.
pub struct AdapterRegistry {
    factories: DashMap<(Exchange, MarketType), AdapterFactory>,
    instances: DashMap<Id, Arc<dyn ExchangeAdapter>>,
    secrets: Arc<dyn SecretStore>,
}

impl AdapterRegistry {
    pub fn new(secrets: Arc<dyn SecretStore>) -> Self {
        Self {
            factories: DashMap::new(),
            instances: DashMap::new(),
            secrets,
        }
    }

    /// Registry with the production exchanges wired in.
    pub fn with_defaults(secrets: Arc<dyn SecretStore>, limiters: Arc<RateLimiters>) -> Self {
        let registry = Self::new(secrets);
        for market_type in [MarketType::Spot, MarketType::Futures] {
            let l = limiters.clone();
            registry.register(
                Exchange::Binance,
                market_type,
                Arc::new(move |account, creds| {
                    Ok(Arc::new(binance::BinanceAdapter::new(
                        creds,
                        account.market_type,
                        account.is_testnet,
                        l.clone(),
                    )) as Arc<dyn ExchangeAdapter>)
                }),
            );
            let l = limiters.clone();
            registry.register(
                Exchange::Bybit,
                market_type,
                Arc::new(move |account, creds| {
                    Ok(Arc::new(bybit::BybitAdapter::new(
                        creds,
                        account.market_type,
                        account.is_testnet,
                        l.clone(),
                    )) as Arc<dyn ExchangeAdapter>)
                }),
            );
        }
        let l = limiters.clone();
        registry.register(
            Exchange::Upbit,
            MarketType::Spot,
            Arc::new(move |_, creds| {
                Ok(Arc::new(upbit::UpbitAdapter::new(creds, l.clone()))
                    as Arc<dyn ExchangeAdapter>)
            }),
        );
        registry
    }

    pub fn register(&self, exchange: Exchange, market_type: MarketType, factory: AdapterFactory) {
        self.factories.insert((exchange, market_type), factory);
    }

    /// Adapter instance for an account, created on first use.
    pub fn adapter_for(&self, account: &Account) -> Result<Arc<dyn ExchangeAdapter>, ExchangeError> {
        if let Some(existing) = self.instances.get(&account.account_id) {
            return Ok(existing.clone());
        }

        let factory = self
            .factories
            .get(&(account.exchange, account.market_type))
            .ok_or_else(|| {
                ExchangeError::Exchange(format!(
                    "no adapter registered for {} {}",
                    account.exchange, account.market_type
                ))
            })?
            .clone();

        let creds = self.secrets.get(account.account_id)?;
        let adapter = factory(account, creds)?;
        self.instances
            .insert(account.account_id, adapter.clone());
        Ok(adapter)
    }

    /// Drop the cached instance (credentials rotated, account removed).
    pub fn evict(&self, account_id: Id) {
        self.instances.remove(&account_id);
    }

    /// Inject a prebuilt adapter (tests, demos).
    pub fn insert_instance(&self, account_id: Id, adapter: Arc<dyn ExchangeAdapter>) {
        self.instances.insert(account_id, adapter);
    }
}

// ============================================================================
// Price cache
// ============================================================================

/// Last-trade price cache keyed by (exchange, canonical symbol). Used by
/// MARKET sizing when the webhook does not carry a price.
pub struct PriceCache {
    prices: DashMap<(Exchange, String), (Decimal, Instant)>,
    ttl: Duration,
}

impl PriceCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            prices: DashMap::new(),
            ttl,
        }
    }

    pub fn get(&self, exchange: Exchange, symbol: &str) -> Option<Decimal> {
        let entry = self.prices.get(&(exchange, symbol.to_string()))?;
        let (price, at) = *entry;
        if at.elapsed() > self.ttl {
            return None;
        }
        Some(price)
    }

    pub fn set(&self, exchange: Exchange, symbol: &str, price: Decimal) {
        self.prices
            .insert((exchange, symbol.to_string()), (price, Instant::now()));
    }
}

/// Native symbol form, e.g. `BTC/USDT` -> `BTCUSDT`, `BTC/KRW` -> `KRW-BTC`.
pub fn to_native_symbol(exchange: Exchange, canonical: &str) -> String {
    let (base, quote) = canonical.split_once('/').unwrap_or((canonical, ""));
    match exchange {
        Exchange::Binance | Exchange::Bybit => format!("{}{}", base, quote),
        Exchange::Upbit | Exchange::Bithumb => format!("{}-{}", quote, base),
    }
}

/// Canonical form from a native symbol, given the exchange.
pub fn from_native_symbol(exchange: Exchange, native: &str) -> String {
    match exchange {
        Exchange::Upbit | Exchange::Bithumb => match native.split_once('-') {
            Some((quote, base)) => format!("{}/{}", base, quote),
            None => native.to_string(),
        },
        Exchange::Binance | Exchange::Bybit => {
            crate::models::canonicalize_symbol(native).unwrap_or_else(|| native.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_cap_formula() {
        let limits = ExchangeLimits { max_per_side: 20, conditional_cap: 5 };
        assert_eq!(limits.max_stop_per_side(0.25), 5);

        // At-least-1 guarantee beats the ratio target for tiny sides.
        let limits = ExchangeLimits { max_per_side: 2, conditional_cap: 5 };
        assert_eq!(limits.max_stop_per_side(0.25), 1);

        // Conditional cap clamps.
        let limits = ExchangeLimits { max_per_side: 40, conditional_cap: 3 };
        assert_eq!(limits.max_stop_per_side(0.25), 3);
    }

    #[test]
    fn test_transient_classification() {
        assert!(ExchangeError::Network("timeout".into()).is_transient());
        assert!(ExchangeError::RateLimit("429".into()).is_transient());
        assert!(!ExchangeError::InvalidOrder("filter".into()).is_transient());
        assert!(!ExchangeError::InsufficientFunds("".into()).is_transient());
    }

    #[test]
    fn test_symbol_conversion() {
        assert_eq!(to_native_symbol(Exchange::Binance, "BTC/USDT"), "BTCUSDT");
        assert_eq!(to_native_symbol(Exchange::Upbit, "BTC/KRW"), "KRW-BTC");
        assert_eq!(from_native_symbol(Exchange::Upbit, "KRW-BTC"), "BTC/KRW");
        assert_eq!(from_native_symbol(Exchange::Binance, "BTCUSDT"), "BTC/USDT");
    }

    #[test]
    fn test_price_cache_ttl() {
        let cache = PriceCache::new(Duration::from_secs(300));
        assert!(cache.get(Exchange::Binance, "BTC/USDT").is_none());
        cache.set(Exchange::Binance, "BTC/USDT", Decimal::new(90_000, 0));
        assert_eq!(
            cache.get(Exchange::Binance, "BTC/USDT"),
            Some(Decimal::new(90_000, 0))
        );
        assert!(cache.get(Exchange::Upbit, "BTC/USDT").is_none());
    }
}
