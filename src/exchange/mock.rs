//! In-memory mock exchange for tests and demos
//!
//! Deterministic: placements are acknowledged (or fail) according to the
//! scripted behavior, every call is captured for assertions, and fills
//! are injected manually into the user stream.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

use super::{
    AssetBalance, ExchangeAdapter, ExchangeError, ExchangeOrder, ExchangeOrderAck,
    ExchangePosition, OrderUpdate, PlaceOrderRequest, SymbolRules, Ticker, UserStreamEvent,
};
use crate::models::{Exchange, OrderStatus};

/// Captured adapter calls, for test assertions.
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    Create { symbol: String, quantity: Decimal },
    Cancel { exchange_order_id: String },
    FetchOrder { exchange_order_id: String },
    FetchOpenOrders,
    FetchBalance,
    FetchTicker { symbol: String },
}

/// Scripted outcome for the next create calls.
#[derive(Debug, Clone)]
pub enum CreateBehavior {
    Accept,
    Reject(ExchangeError),
    /// Simulate a hung REST call.
    Hang(std::time::Duration),
}

pub struct MockExchange {
    pub exchange: Exchange,
    next_id: AtomicU64,
    create_behavior: Mutex<CreateBehavior>,
    cancel_fails: Mutex<bool>,
    calls: Mutex<Vec<MockCall>>,
    orders: Mutex<HashMap<String, ExchangeOrder>>,
    balances: Mutex<Vec<AssetBalance>>,
    tickers: Mutex<HashMap<String, Decimal>>,
    stream_tx: Mutex<Option<mpsc::Sender<UserStreamEvent>>>,
}

impl MockExchange {
    pub fn new() -> Self {
        Self {
            exchange: Exchange::Binance,
            next_id: AtomicU64::new(1),
            create_behavior: Mutex::new(CreateBehavior::Accept),
            cancel_fails: Mutex::new(false),
            calls: Mutex::new(Vec::new()),
            orders: Mutex::new(HashMap::new()),
            balances: Mutex::new(vec![AssetBalance {
                asset: "USDT".to_string(),
                free: Decimal::new(10_000, 0),
                locked: Decimal::ZERO,
            }]),
            tickers: Mutex::new(HashMap::new()),
            stream_tx: Mutex::new(None),
        }
    }

    pub fn set_create_behavior(&self, behavior: CreateBehavior) {
        *self.create_behavior.lock().unwrap() = behavior;
    }

    pub fn set_cancel_fails(&self, fails: bool) {
        *self.cancel_fails.lock().unwrap() = fails;
    }

    pub fn set_balance(&self, asset: &str, free: Decimal) {
        *self.balances.lock().unwrap() = vec![AssetBalance {
            asset: asset.to_string(),
            free,
            locked: Decimal::ZERO,
        }];
    }

    pub fn set_ticker(&self, symbol: &str, price: Decimal) {
        self.tickers
            .lock()
            .unwrap()
            .insert(symbol.to_string(), price);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn open_order_count(&self) -> usize {
        self.orders.lock().unwrap().len()
    }

    fn record(&self, call: MockCall) {
        self.calls.lock().unwrap().push(call);
    }

    /// Drive the user stream from a test: deliver an update as the
    /// exchange would, marking the exchange-side order settled when the
    /// status is terminal.
    pub async fn push_update(&self, update: OrderUpdate) {
        if update.status.is_terminal() {
            self.orders
                .lock()
                .unwrap()
                .remove(&update.exchange_order_id);
        } else if let Some(order) = self
            .orders
            .lock()
            .unwrap()
            .get_mut(&update.exchange_order_id)
        {
            order.status = update.status;
            order.filled_quantity = update.filled_quantity;
        }
        let tx = self.stream_tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(UserStreamEvent::Order(update)).await;
        }
    }
}

impl Default for MockExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExchangeAdapter for MockExchange {
    fn exchange(&self) -> Exchange {
        self.exchange
    }

    async fn create_order(
        &self,
        req: &PlaceOrderRequest,
    ) -> Result<ExchangeOrderAck, ExchangeError> {
        self.record(MockCall::Create {
            symbol: req.symbol.clone(),
            quantity: req.quantity,
        });

        let behavior = self.create_behavior.lock().unwrap().clone();
        match behavior {
            CreateBehavior::Accept => {}
            CreateBehavior::Reject(e) => return Err(e),
            CreateBehavior::Hang(d) => tokio::time::sleep(d).await,
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        self.orders.lock().unwrap().insert(
            id.clone(),
            ExchangeOrder {
                exchange_order_id: id.clone(),
                symbol: req.symbol.clone(),
                side: req.side,
                order_type: req.order_type,
                status: OrderStatus::Open,
                quantity: req.quantity,
                filled_quantity: Decimal::ZERO,
                price: req.price,
                avg_price: None,
            },
        );
        Ok(ExchangeOrderAck {
            exchange_order_id: id,
            status: OrderStatus::Open,
        })
    }

    async fn cancel_order(
        &self,
        _symbol: &str,
        exchange_order_id: &str,
    ) -> Result<(), ExchangeError> {
        self.record(MockCall::Cancel {
            exchange_order_id: exchange_order_id.to_string(),
        });
        if *self.cancel_fails.lock().unwrap() {
            return Err(ExchangeError::Exchange("cancel rejected".to_string()));
        }
        self.orders.lock().unwrap().remove(exchange_order_id);
        Ok(())
    }

    async fn fetch_order(
        &self,
        _symbol: &str,
        exchange_order_id: &str,
    ) -> Result<ExchangeOrder, ExchangeError> {
        self.record(MockCall::FetchOrder {
            exchange_order_id: exchange_order_id.to_string(),
        });
        self.orders
            .lock()
            .unwrap()
            .get(exchange_order_id)
            .cloned()
            .ok_or_else(|| ExchangeError::Exchange("order not found".to_string()))
    }

    async fn fetch_open_orders(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        self.record(MockCall::FetchOpenOrders);
        Ok(self
            .orders
            .lock()
            .unwrap()
            .values()
            .filter(|o| symbol.map_or(true, |s| o.symbol == s))
            .cloned()
            .collect())
    }

    async fn fetch_balance(&self) -> Result<Vec<AssetBalance>, ExchangeError> {
        self.record(MockCall::FetchBalance);
        Ok(self.balances.lock().unwrap().clone())
    }

    async fn fetch_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
        Ok(Vec::new())
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        self.record(MockCall::FetchTicker {
            symbol: symbol.to_string(),
        });
        let last = self
            .tickers
            .lock()
            .unwrap()
            .get(symbol)
            .copied()
            .unwrap_or(Decimal::ZERO);
        Ok(Ticker {
            symbol: symbol.to_string(),
            last,
        })
    }

    async fn load_markets(&self) -> Result<Vec<(String, SymbolRules)>, ExchangeError> {
        Ok(vec![(
            "BTC/USDT".to_string(),
            SymbolRules {
                min_qty: Decimal::new(1, 4),
                max_qty: Decimal::new(1_000, 0),
                step_size: Decimal::new(1, 3),
                min_price: Decimal::new(1, 2),
                max_price: Decimal::new(1_000_000, 0),
                tick_size: Decimal::new(1, 2),
                min_notional: Decimal::new(5, 0),
            },
        )])
    }

    async fn connect_user_stream(
        &self,
    ) -> Result<mpsc::Receiver<UserStreamEvent>, ExchangeError> {
        let (tx, rx) = mpsc::channel(64);
        *self.stream_tx.lock().unwrap() = Some(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MarketType, OrderType, Side};

    fn req() -> PlaceOrderRequest {
        PlaceOrderRequest {
            symbol: "BTC/USDT".to_string(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            quantity: Decimal::new(5, 3),
            price: Some(Decimal::new(90_000, 0)),
            stop_price: None,
            market_type: MarketType::Spot,
        }
    }

    #[tokio::test]
    async fn test_accept_and_cancel() {
        let mock = MockExchange::new();
        let ack = mock.create_order(&req()).await.unwrap();
        assert_eq!(ack.status, OrderStatus::Open);
        assert_eq!(mock.open_order_count(), 1);

        mock.cancel_order("BTC/USDT", &ack.exchange_order_id)
            .await
            .unwrap();
        assert_eq!(mock.open_order_count(), 0);
    }

    #[tokio::test]
    async fn test_scripted_rejection() {
        let mock = MockExchange::new();
        mock.set_create_behavior(CreateBehavior::Reject(ExchangeError::InsufficientFunds(
            "no funds".to_string(),
        )));
        assert!(mock.create_order(&req()).await.is_err());
        assert_eq!(mock.open_order_count(), 0);
    }

    #[tokio::test]
    async fn test_stream_injection() {
        let mock = MockExchange::new();
        let ack = mock.create_order(&req()).await.unwrap();
        let mut rx = mock.connect_user_stream().await.unwrap();

        mock.push_update(OrderUpdate {
            exchange_order_id: ack.exchange_order_id.clone(),
            symbol: "BTC/USDT".to_string(),
            status: OrderStatus::Filled,
            filled_quantity: Decimal::new(5, 3),
            fill: None,
        })
        .await;

        match rx.recv().await {
            Some(UserStreamEvent::Order(update)) => {
                assert_eq!(update.status, OrderStatus::Filled)
            }
            other => panic!("unexpected event: {:?}", other),
        }
        // Terminal update settles the exchange-side order.
        assert_eq!(mock.open_order_count(), 0);
    }
}
