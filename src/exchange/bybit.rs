//! Bybit v5 adapter
//!
//! REST requests sign `timestamp + api_key + recv_window + payload` with
//! HMAC-SHA256 into the `X-BAPI-SIGN` header. The private WebSocket
//! authenticates with an `auth` op before subscribing to the `order` and
//! `execution` topics.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use super::{
    from_native_symbol, to_native_symbol, AssetBalance, EndpointClass, ExchangeAdapter,
    ExchangeError, ExchangeOrder, ExchangeOrderAck, ExchangePosition, FillData, OrderUpdate,
    PlaceOrderRequest, RateLimiters, SymbolRules, Ticker, UserStreamEvent,
};
use crate::models::{Exchange, MarketType, OrderStatus, OrderType, Side};
use crate::secrets::ApiCredentials;

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW: &str = "5000";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct BybitAdapter {
    creds: ApiCredentials,
    market_type: MarketType,
    client: reqwest::Client,
    limiters: Arc<RateLimiters>,
    rest_base: String,
    ws_private: String,
}

impl BybitAdapter {
    pub fn new(
        creds: ApiCredentials,
        market_type: MarketType,
        is_testnet: bool,
        limiters: Arc<RateLimiters>,
    ) -> Self {
        let (rest_base, ws_private) = if is_testnet {
            (
                "https://api-testnet.bybit.com".to_string(),
                "wss://stream-testnet.bybit.com/v5/private".to_string(),
            )
        } else {
            (
                "https://api.bybit.com".to_string(),
                "wss://stream.bybit.com/v5/private".to_string(),
            )
        };
        Self {
            creds,
            market_type,
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            limiters,
            rest_base,
            ws_private,
        }
    }

    fn category(&self) -> &'static str {
        match self.market_type {
            MarketType::Futures => "linear",
            _ => "spot",
        }
    }

    fn sign_payload(&self, timestamp: &str, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.creds.api_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(timestamp.as_bytes());
        mac.update(self.creds.api_key.as_bytes());
        mac.update(RECV_WINDOW.as_bytes());
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn get_signed(
        &self,
        path: &str,
        query: &str,
        class: EndpointClass,
    ) -> Result<Value, ExchangeError> {
        let _guard = self.limiters.throttle(Exchange::Bybit, class).await;
        let timestamp = chrono::Utc::now().timestamp_millis().to_string();
        let sign = self.sign_payload(&timestamp, query);
        let url = if query.is_empty() {
            format!("{}{}", self.rest_base, path)
        } else {
            format!("{}{}?{}", self.rest_base, path, query)
        };
        let response = self
            .client
            .get(&url)
            .header("X-BAPI-API-KEY", &self.creds.api_key)
            .header("X-BAPI-TIMESTAMP", &timestamp)
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
            .header("X-BAPI-SIGN", &sign)
            .send()
            .await?;
        Self::decode_response(response).await
    }

    async fn post_signed(
        &self,
        path: &str,
        body: &Value,
        class: EndpointClass,
    ) -> Result<Value, ExchangeError> {
        let _guard = self.limiters.throttle(Exchange::Bybit, class).await;
        let timestamp = chrono::Utc::now().timestamp_millis().to_string();
        let payload = body.to_string();
        let sign = self.sign_payload(&timestamp, &payload);
        let response = self
            .client
            .post(format!("{}{}", self.rest_base, path))
            .header("X-BAPI-API-KEY", &self.creds.api_key)
            .header("X-BAPI-TIMESTAMP", &timestamp)
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
            .header("X-BAPI-SIGN", &sign)
            .header("Content-Type", "application/json")
            .body(payload)
            .send()
            .await?;
        Self::decode_response(response).await
    }

    async fn decode_response(response: reqwest::Response) -> Result<Value, ExchangeError> {
        let http = response.status().as_u16();
        let body: Value = response
            .json()
            .await
            .map_err(|e| ExchangeError::Exchange(format!("malformed response: {}", e)))?;

        let ret_code = body.get("retCode").and_then(Value::as_i64).unwrap_or(-1);
        if ret_code == 0 {
            return Ok(body.get("result").cloned().unwrap_or(Value::Null));
        }

        let msg = body
            .get("retMsg")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        Err(Self::map_error(http, ret_code, msg))
    }

    fn map_error(http: u16, ret_code: i64, msg: String) -> ExchangeError {
        match (http, ret_code) {
            (429, _) | (_, 10006) => ExchangeError::RateLimit(msg),
            (_, 10003) | (_, 10004) | (_, 10005) | (401, _) => ExchangeError::Auth(msg),
            (_, 110007) | (_, 110012) | (_, 110052) => ExchangeError::InsufficientFunds(msg),
            (_, 110001) | (_, 110003) | (_, 110009) | (_, 110017) => {
                ExchangeError::InvalidOrder(msg)
            }
            (s, _) if s >= 500 => ExchangeError::Network(msg),
            _ => ExchangeError::Exchange(msg),
        }
    }

    fn map_status(raw: &str) -> OrderStatus {
        match raw {
            "New" | "Untriggered" => OrderStatus::Open,
            "PartiallyFilled" => OrderStatus::PartiallyFilled,
            "Filled" => OrderStatus::Filled,
            "Cancelled" | "PartiallyFilledCanceled" | "Deactivated" => OrderStatus::Cancelled,
            "Rejected" => OrderStatus::Rejected,
            "Expired" => OrderStatus::Expired,
            _ => OrderStatus::Open,
        }
    }

    fn parse_decimal(v: &Value, key: &str) -> Decimal {
        v.get(key)
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or(Decimal::ZERO)
    }

    fn order_from_json(v: &Value) -> ExchangeOrder {
        let side = match v.get("side").and_then(Value::as_str) {
            Some("Sell") => Side::Sell,
            _ => Side::Buy,
        };
        let has_trigger = !Self::parse_decimal(v, "triggerPrice").is_zero();
        let order_type = match (v.get("orderType").and_then(Value::as_str), has_trigger) {
            (Some("Market"), false) => OrderType::Market,
            (Some("Market"), true) => OrderType::StopMarket,
            (_, true) => OrderType::StopLimit,
            _ => OrderType::Limit,
        };
        let price = Self::parse_decimal(v, "price");
        let avg = Self::parse_decimal(v, "avgPrice");
        ExchangeOrder {
            exchange_order_id: v
                .get("orderId")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            symbol: from_native_symbol(
                Exchange::Bybit,
                v.get("symbol").and_then(Value::as_str).unwrap_or_default(),
            ),
            side,
            order_type,
            status: Self::map_status(v.get("orderStatus").and_then(Value::as_str).unwrap_or("")),
            quantity: Self::parse_decimal(v, "qty"),
            filled_quantity: Self::parse_decimal(v, "cumExecQty"),
            price: if price.is_zero() { None } else { Some(price) },
            avg_price: if avg.is_zero() { None } else { Some(avg) },
        }
    }

    /// Normalize one message from the private `order` / `execution`
    /// topics into zero or more OrderUpdates.
    fn updates_from_ws(value: &Value) -> Vec<OrderUpdate> {
        let topic = value.get("topic").and_then(Value::as_str).unwrap_or("");
        let data = value.get("data").and_then(Value::as_array);
        let Some(rows) = data else { return Vec::new() };

        match topic {
            "order" => rows
                .iter()
                .map(|o| OrderUpdate {
                    exchange_order_id: o
                        .get("orderId")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    symbol: from_native_symbol(
                        Exchange::Bybit,
                        o.get("symbol").and_then(Value::as_str).unwrap_or_default(),
                    ),
                    status: Self::map_status(
                        o.get("orderStatus").and_then(Value::as_str).unwrap_or(""),
                    ),
                    filled_quantity: Self::parse_decimal(o, "cumExecQty"),
                    fill: None,
                })
                .collect(),
            "execution" => rows
                .iter()
                .map(|e| {
                    let qty = Self::parse_decimal(e, "execQty");
                    OrderUpdate {
                        exchange_order_id: e
                            .get("orderId")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        symbol: from_native_symbol(
                            Exchange::Bybit,
                            e.get("symbol").and_then(Value::as_str).unwrap_or_default(),
                        ),
                        // The paired order-topic message carries the
                        // authoritative status; executions only add fills.
                        status: OrderStatus::PartiallyFilled,
                        filled_quantity: Decimal::ZERO,
                        fill: Some(FillData {
                            exchange_trade_id: e
                                .get("execId")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            price: Self::parse_decimal(e, "execPrice"),
                            quantity: qty,
                            commission: Self::parse_decimal(e, "execFee"),
                            commission_asset: e
                                .get("feeCurrency")
                                .and_then(Value::as_str)
                                .map(|s| s.to_string()),
                            is_maker: e.get("isMaker").and_then(Value::as_bool).unwrap_or(false),
                        }),
                    }
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

#[async_trait]
impl ExchangeAdapter for BybitAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Bybit
    }

    async fn create_order(
        &self,
        req: &PlaceOrderRequest,
    ) -> Result<ExchangeOrderAck, ExchangeError> {
        let order_type = match req.order_type {
            OrderType::Market | OrderType::StopMarket => "Market",
            OrderType::Limit | OrderType::StopLimit => "Limit",
        };
        let mut body = json!({
            "category": self.category(),
            "symbol": to_native_symbol(Exchange::Bybit, &req.symbol),
            "side": match req.side { Side::Buy => "Buy", Side::Sell => "Sell" },
            "orderType": order_type,
            "qty": req.quantity.to_string(),
        });
        if let Some(price) = req.price {
            body["price"] = json!(price.to_string());
        }
        if let Some(stop) = req.stop_price {
            body["triggerPrice"] = json!(stop.to_string());
            body["triggerDirection"] = json!(match req.side {
                Side::Buy => 1,  // trigger when price rises to stop
                Side::Sell => 2, // trigger when price falls to stop
            });
        }

        let result = self
            .post_signed("/v5/order/create", &body, EndpointClass::Order)
            .await?;

        let exchange_order_id = result
            .get("orderId")
            .and_then(Value::as_str)
            .ok_or_else(|| ExchangeError::Exchange("missing orderId in ack".to_string()))?
            .to_string();

        Ok(ExchangeOrderAck {
            exchange_order_id,
            status: OrderStatus::Open,
        })
    }

    async fn cancel_order(
        &self,
        symbol: &str,
        exchange_order_id: &str,
    ) -> Result<(), ExchangeError> {
        let body = json!({
            "category": self.category(),
            "symbol": to_native_symbol(Exchange::Bybit, symbol),
            "orderId": exchange_order_id,
        });
        self.post_signed("/v5/order/cancel", &body, EndpointClass::Order)
            .await?;
        Ok(())
    }

    async fn fetch_order(
        &self,
        symbol: &str,
        exchange_order_id: &str,
    ) -> Result<ExchangeOrder, ExchangeError> {
        let query = format!(
            "category={}&symbol={}&orderId={}",
            self.category(),
            to_native_symbol(Exchange::Bybit, symbol),
            exchange_order_id
        );
        let result = self
            .get_signed("/v5/order/realtime", &query, EndpointClass::Query)
            .await?;
        let order = result
            .get("list")
            .and_then(Value::as_array)
            .and_then(|l| l.first())
            .cloned();

        match order {
            Some(o) => Ok(Self::order_from_json(&o)),
            // Fall back to order history for settled orders.
            None => {
                let query = format!(
                    "category={}&orderId={}",
                    self.category(),
                    exchange_order_id
                );
                let result = self
                    .get_signed("/v5/order/history", &query, EndpointClass::Query)
                    .await?;
                result
                    .get("list")
                    .and_then(Value::as_array)
                    .and_then(|l| l.first())
                    .map(Self::order_from_json)
                    .ok_or_else(|| ExchangeError::Exchange("order not found".to_string()))
            }
        }
    }

    async fn fetch_open_orders(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        let mut query = format!("category={}", self.category());
        if let Some(sym) = symbol {
            query.push_str(&format!(
                "&symbol={}",
                to_native_symbol(Exchange::Bybit, sym)
            ));
        } else if self.market_type == MarketType::Futures {
            query.push_str("&settleCoin=USDT");
        }
        let result = self
            .get_signed("/v5/order/realtime", &query, EndpointClass::Query)
            .await?;
        Ok(result
            .get("list")
            .and_then(Value::as_array)
            .map(|l| l.iter().map(Self::order_from_json).collect())
            .unwrap_or_default())
    }

    async fn fetch_balance(&self) -> Result<Vec<AssetBalance>, ExchangeError> {
        let query = "accountType=UNIFIED".to_string();
        let result = self
            .get_signed("/v5/account/wallet-balance", &query, EndpointClass::Query)
            .await?;
        let coins = result
            .get("list")
            .and_then(Value::as_array)
            .and_then(|l| l.first())
            .and_then(|acct| acct.get("coin"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(coins
            .iter()
            .map(|c| AssetBalance {
                asset: c
                    .get("coin")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                free: Self::parse_decimal(c, "availableToWithdraw")
                    .max(Self::parse_decimal(c, "walletBalance")),
                locked: Self::parse_decimal(c, "locked"),
            })
            .filter(|b| !b.free.is_zero() || !b.locked.is_zero())
            .collect())
    }

    async fn fetch_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
        if self.market_type != MarketType::Futures {
            return Ok(Vec::new());
        }
        let query = format!("category={}&settleCoin=USDT", self.category());
        let result = self
            .get_signed("/v5/position/list", &query, EndpointClass::Query)
            .await?;
        Ok(result
            .get("list")
            .and_then(Value::as_array)
            .map(|positions| {
                positions
                    .iter()
                    .map(|p| {
                        let size = Self::parse_decimal(p, "size");
                        let signed = match p.get("side").and_then(Value::as_str) {
                            Some("Sell") => -size,
                            _ => size,
                        };
                        ExchangePosition {
                            symbol: from_native_symbol(
                                Exchange::Bybit,
                                p.get("symbol").and_then(Value::as_str).unwrap_or_default(),
                            ),
                            quantity: signed,
                            entry_price: Self::parse_decimal(p, "avgPrice"),
                            mark_price: Self::parse_decimal(p, "markPrice"),
                            unrealized_pnl: Self::parse_decimal(p, "unrealisedPnl"),
                        }
                    })
                    .filter(|p| !p.quantity.is_zero())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        let _guard = self
            .limiters
            .throttle(Exchange::Bybit, EndpointClass::Market)
            .await;
        let url = format!(
            "{}/v5/market/tickers?category={}&symbol={}",
            self.rest_base,
            self.category(),
            to_native_symbol(Exchange::Bybit, symbol)
        );
        let response = self.client.get(&url).send().await?;
        let result = Self::decode_response(response).await?;
        let last = result
            .get("list")
            .and_then(Value::as_array)
            .and_then(|l| l.first())
            .map(|t| Self::parse_decimal(t, "lastPrice"))
            .unwrap_or(Decimal::ZERO);
        Ok(Ticker {
            symbol: symbol.to_string(),
            last,
        })
    }

    async fn load_markets(&self) -> Result<Vec<(String, SymbolRules)>, ExchangeError> {
        let _guard = self
            .limiters
            .throttle(Exchange::Bybit, EndpointClass::Market)
            .await;
        let url = format!(
            "{}/v5/market/instruments-info?category={}&limit=1000",
            self.rest_base,
            self.category()
        );
        let response = self.client.get(&url).send().await?;
        let result = Self::decode_response(response).await?;
        let list = result
            .get("list")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut out = Vec::with_capacity(list.len());
        for s in &list {
            if s.get("status").and_then(Value::as_str) != Some("Trading") {
                continue;
            }
            let native = s.get("symbol").and_then(Value::as_str).unwrap_or_default();
            let lot = s.get("lotSizeFilter").cloned().unwrap_or(Value::Null);
            let price = s.get("priceFilter").cloned().unwrap_or(Value::Null);
            let rules = SymbolRules {
                min_qty: Self::parse_decimal(&lot, "minOrderQty"),
                max_qty: Self::parse_decimal(&lot, "maxOrderQty"),
                step_size: Self::parse_decimal(&lot, "qtyStep")
                    .max(Self::parse_decimal(&lot, "basePrecision")),
                min_price: Self::parse_decimal(&price, "minPrice"),
                max_price: Self::parse_decimal(&price, "maxPrice"),
                tick_size: Self::parse_decimal(&price, "tickSize"),
                min_notional: Self::parse_decimal(&lot, "minOrderAmt")
                    .max(Self::parse_decimal(&lot, "minNotionalValue")),
            };
            out.push((from_native_symbol(Exchange::Bybit, native), rules));
        }
        Ok(out)
    }

    async fn connect_user_stream(
        &self,
    ) -> Result<mpsc::Receiver<UserStreamEvent>, ExchangeError> {
        let (ws, _) = connect_async(self.ws_private.as_str())
            .await
            .map_err(|e| ExchangeError::Network(format!("user stream connect: {}", e)))?;
        let (mut write, mut read) = ws.split();

        // Authenticate: sign "GET/realtime{expires}".
        let expires = chrono::Utc::now().timestamp_millis() + 10_000;
        let mut mac = HmacSha256::new_from_slice(self.creds.api_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(format!("GET/realtime{}", expires).as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        let auth = json!({
            "op": "auth",
            "args": [self.creds.api_key, expires, signature],
        });
        write
            .send(Message::Text(auth.to_string()))
            .await
            .map_err(|e| ExchangeError::Network(format!("auth send: {}", e)))?;

        let subscribe = json!({
            "op": "subscribe",
            "args": ["order", "execution"],
        });
        write
            .send(Message::Text(subscribe.to_string()))
            .await
            .map_err(|e| ExchangeError::Network(format!("subscribe send: {}", e)))?;

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        let Ok(value) = serde_json::from_str::<Value>(&text) else {
                            tracing::warn!("Unparseable user stream message, skipping");
                            continue;
                        };
                        for update in Self::updates_from_ws(&value) {
                            if tx.send(UserStreamEvent::Order(update)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => {
                        let _ = tx
                            .send(UserStreamEvent::Disconnected {
                                reason: "socket closed".to_string(),
                            })
                            .await;
                        break;
                    }
                    _ => {}
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(BybitAdapter::map_status("New"), OrderStatus::Open);
        assert_eq!(
            BybitAdapter::map_status("PartiallyFilled"),
            OrderStatus::PartiallyFilled
        );
        assert_eq!(BybitAdapter::map_status("Filled"), OrderStatus::Filled);
        assert_eq!(BybitAdapter::map_status("Cancelled"), OrderStatus::Cancelled);
        assert_eq!(BybitAdapter::map_status("Rejected"), OrderStatus::Rejected);
    }

    #[test]
    fn test_error_mapping() {
        assert!(matches!(
            BybitAdapter::map_error(200, 10006, "rate".into()),
            ExchangeError::RateLimit(_)
        ));
        assert!(matches!(
            BybitAdapter::map_error(200, 10003, "key".into()),
            ExchangeError::Auth(_)
        ));
        assert!(matches!(
            BybitAdapter::map_error(200, 110007, "ab not enough".into()),
            ExchangeError::InsufficientFunds(_)
        ));
        assert!(matches!(
            BybitAdapter::map_error(503, 0, "maintenance".into()),
            ExchangeError::Network(_)
        ));
    }

    #[test]
    fn test_execution_topic_normalization() {
        let raw = json!({
            "topic": "execution",
            "data": [{
                "orderId": "abc-123",
                "symbol": "BTCUSDT",
                "execId": "exec-1",
                "execPrice": "90000.5",
                "execQty": "0.002",
                "execFee": "0.09",
                "isMaker": false
            }]
        });
        let updates = BybitAdapter::updates_from_ws(&raw);
        assert_eq!(updates.len(), 1);
        let fill = updates[0].fill.as_ref().unwrap();
        assert_eq!(fill.exchange_trade_id, "exec-1");
        assert_eq!(updates[0].symbol, "BTC/USDT");
    }

    #[test]
    fn test_unknown_topic_ignored() {
        let raw = json!({"topic": "wallet", "data": []});
        assert!(BybitAdapter::updates_from_ws(&raw).is_empty());
    }
}
