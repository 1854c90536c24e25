//! Symbol catalog and precision rules
//!
//! Order parameters are snapped DOWN to tick/step before any sizing
//! check, so everything we send is guaranteed to pass the exchange
//! filters. The catalog is warmed at startup and refreshed hourly at a
//! :15 minute offset to stay clear of top-of-hour API contention.

use chrono::{Timelike, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;

use super::{ExchangeAdapter, ExchangeError};
use crate::models::Exchange;

/// Per-symbol trading constraints.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolRules {
    pub min_qty: Decimal,
    pub max_qty: Decimal,
    pub step_size: Decimal,
    pub min_price: Decimal,
    pub max_price: Decimal,
    pub tick_size: Decimal,
    pub min_notional: Decimal,
}

impl SymbolRules {
    /// Snap a quantity down to the step grid.
    pub fn snap_qty(&self, qty: Decimal) -> Decimal {
        snap_down(qty, self.step_size)
    }

    /// Snap a price down to the tick grid.
    pub fn snap_price(&self, price: Decimal) -> Decimal {
        snap_down(price, self.tick_size)
    }

    /// Full acceptance check for an already-snapped quantity.
    pub fn check_qty(&self, qty: Decimal, reference_price: Decimal) -> Result<(), String> {
        if qty < self.min_qty {
            return Err(format!("quantity {} below min_qty {}", qty, self.min_qty));
        }
        if self.max_qty > Decimal::ZERO && qty > self.max_qty {
            return Err(format!("quantity {} above max_qty {}", qty, self.max_qty));
        }
        let notional = qty * reference_price;
        if notional < self.min_notional {
            return Err(format!(
                "notional {} below min_notional {}",
                notional, self.min_notional
            ));
        }
        Ok(())
    }
}

/// Round a value down onto a grid of `step`. A zero step passes the
/// value through unchanged.
pub fn snap_down(value: Decimal, step: Decimal) -> Decimal {
    if step.is_zero() {
        return value;
    }
    (value / step).floor() * step
}

/// Upbit/Bithumb KRW markets derive the tick from the price band
/// instead of a per-symbol filter.
pub fn krw_tick_for_price(price: Decimal) -> Decimal {
    let p = price;
    let d = |v: i64, scale: u32| Decimal::new(v, scale);
    if p >= d(2_000_000, 0) {
        d(1_000, 0)
    } else if p >= d(1_000_000, 0) {
        d(500, 0)
    } else if p >= d(500_000, 0) {
        d(100, 0)
    } else if p >= d(100_000, 0) {
        d(50, 0)
    } else if p >= d(10_000, 0) {
        d(10, 0)
    } else if p >= d(1_000, 0) {
        d(1, 0)
    } else if p >= d(100, 0) {
        d(1, 1) // 0.1
    } else if p >= d(10, 0) {
        d(1, 2) // 0.01
    } else {
        d(1, 3) // 0.001
    }
}

/// In-memory symbol catalog keyed by (exchange, canonical symbol).
pub struct MarketCatalog {
    rules: DashMap<(Exchange, String), SymbolRules>,
}

impl MarketCatalog {
    pub fn new() -> Self {
        Self {
            rules: DashMap::new(),
        }
    }

    pub fn get(&self, exchange: Exchange, symbol: &str) -> Option<SymbolRules> {
        self.rules
            .get(&(exchange, symbol.to_string()))
            .map(|r| r.clone())
    }

    pub fn insert(&self, exchange: Exchange, symbol: &str, rules: SymbolRules) {
        self.rules.insert((exchange, symbol.to_string()), rules);
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Pull fresh rules from one adapter and replace that exchange's
    /// entries. Failures leave the previous snapshot in place.
    pub async fn refresh_from(
        &self,
        adapter: &Arc<dyn ExchangeAdapter>,
    ) -> Result<usize, ExchangeError> {
        let markets = adapter.load_markets().await?;
        let exchange = adapter.exchange();
        let count = markets.len();
        for (symbol, rules) in markets {
            self.insert(exchange, &symbol, rules);
        }
        tracing::info!(%exchange, symbols = count, "Symbol catalog refreshed");
        Ok(count)
    }

    /// Warm the catalog from a set of adapters. Startup tolerates
    /// partial failure; the affected exchange retries on the hourly tick.
    pub async fn warm(&self, adapters: &[Arc<dyn ExchangeAdapter>]) {
        for adapter in adapters {
            if let Err(e) = self.refresh_from(adapter).await {
                tracing::warn!(exchange = %adapter.exchange(), error = %e, "Catalog warm failed");
            }
        }
    }
}

impl Default for MarketCatalog {
    fn default() -> Self {
        Self::new()
    }
}

/// Sleep until the next hh:MM boundary given by `minute_offset`.
pub async fn sleep_until_minute_offset(minute_offset: u32) {
    let now = Utc::now();
    let current_minute = now.minute();
    let minutes_ahead = if current_minute < minute_offset {
        minute_offset - current_minute
    } else {
        60 - current_minute + minute_offset
    };
    let secs = u64::from(minutes_ahead) * 60;
    let into_minute = u64::from(now.second());
    tokio::time::sleep(Duration::from_secs(secs.saturating_sub(into_minute).max(1))).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::prelude::FromPrimitive;

    fn dec(v: f64) -> Decimal {
        Decimal::from_f64(v).unwrap()
    }

    fn btc_rules() -> SymbolRules {
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

    #[test]
    fn test_snap_down() {
        let rules = btc_rules();
        assert_eq!(rules.snap_qty(dec(0.0055)), dec(0.005));
        assert_eq!(rules.snap_qty(dec(0.005)), dec(0.005));
        assert_eq!(rules.snap_price(dec(90_000.019)), dec(90_000.01));
        // Zero step passes through
        assert_eq!(snap_down(dec(1.2345), Decimal::ZERO), dec(1.2345));
    }

    #[test]
    fn test_check_qty_boundaries() {
        let rules = btc_rules();
        assert!(rules.check_qty(dec(0.005), dec(90_000.0)).is_ok());
        assert!(rules.check_qty(dec(0.00005), dec(90_000.0)).is_err()); // below min_qty
        assert!(rules.check_qty(dec(2000.0), dec(90_000.0)).is_err()); // above max_qty
        assert!(rules.check_qty(dec(0.001), dec(1.0)).is_err()); // below min_notional
    }

    #[test]
    fn test_krw_tick_ladder() {
        assert_eq!(krw_tick_for_price(dec(2_500_000.0)), dec(1_000.0));
        assert_eq!(krw_tick_for_price(dec(750_000.0)), dec(100.0));
        assert_eq!(krw_tick_for_price(dec(55_000.0)), dec(10.0));
        assert_eq!(krw_tick_for_price(dec(500.0)), dec(0.1));
        assert_eq!(krw_tick_for_price(dec(5.0)), dec(0.001));
    }

    #[test]
    fn test_catalog_round_trip() {
        let catalog = MarketCatalog::new();
        assert!(catalog.get(Exchange::Binance, "BTC/USDT").is_none());
        catalog.insert(Exchange::Binance, "BTC/USDT", btc_rules());
        assert_eq!(catalog.get(Exchange::Binance, "BTC/USDT"), Some(btc_rules()));
        // Isolation across exchanges
        assert!(catalog.get(Exchange::Upbit, "BTC/USDT").is_none());
    }
}
