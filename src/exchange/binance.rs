//! Binance adapter (spot and USD-M futures)
//!
//! REST requests are HMAC-SHA256 signed over the query string; the
//! user-data stream authenticates with a listen-key obtained (and kept
//! alive) over REST.

use async_trait::async_trait;
use futures::StreamExt;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde_json::Value;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
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

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct BinanceAdapter {
    creds: ApiCredentials,
    market_type: MarketType,
    client: reqwest::Client,
    limiters: Arc<RateLimiters>,
    rest_base: String,
    ws_base: String,
    /// Current listen-key; refreshed by keepalive.
    listen_key: Mutex<Option<String>>,
}

impl BinanceAdapter {
    pub fn new(
        creds: ApiCredentials,
        market_type: MarketType,
        is_testnet: bool,
        limiters: Arc<RateLimiters>,
    ) -> Self {
        let (rest_base, ws_base) = match (market_type, is_testnet) {
            (MarketType::Futures, false) => (
                "https://fapi.binance.com".to_string(),
                "wss://fstream.binance.com/ws".to_string(),
            ),
            (MarketType::Futures, true) => (
                "https://testnet.binancefuture.com".to_string(),
                "wss://stream.binancefuture.com/ws".to_string(),
            ),
            (_, true) => (
                "https://testnet.binance.vision".to_string(),
                "wss://testnet.binance.vision/ws".to_string(),
            ),
            (_, false) => (
                "https://api.binance.com".to_string(),
                "wss://stream.binance.com:9443/ws".to_string(),
            ),
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
            ws_base,
            listen_key: Mutex::new(None),
        }
    }

    fn api_prefix(&self) -> &'static str {
        match self.market_type {
            MarketType::Futures => "/fapi/v1",
            _ => "/api/v3",
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.creds.api_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Signed request with the query-string signature scheme.
    async fn signed_request(
        &self,
        method: reqwest::Method,
        path: &str,
        params: Vec<(String, String)>,
        class: EndpointClass,
    ) -> Result<Value, ExchangeError> {
        let _guard = self.limiters.throttle(Exchange::Binance, class).await;

        let mut query = params;
        query.push(("timestamp".to_string(), Self::timestamp_ms().to_string()));
        query.push(("recvWindow".to_string(), "5000".to_string()));
        let encoded: String = query
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        let signature = self.sign(&encoded);
        let url = format!(
            "{}{}?{}&signature={}",
            self.rest_base, path, encoded, signature
        );

        let response = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.creds.api_key)
            .send()
            .await?;

        Self::decode_response(response).await
    }

    async fn public_request(
        &self,
        path: &str,
        params: &[(&str, &str)],
        class: EndpointClass,
    ) -> Result<Value, ExchangeError> {
        let _guard = self.limiters.throttle(Exchange::Binance, class).await;
        let response = self
            .client
            .get(format!("{}{}", self.rest_base, path))
            .query(params)
            .send()
            .await?;
        Self::decode_response(response).await
    }

    async fn decode_response(response: reqwest::Response) -> Result<Value, ExchangeError> {
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| ExchangeError::Exchange(format!("malformed response: {}", e)))?;

        if status.is_success() {
            return Ok(body);
        }

        let code = body.get("code").and_then(Value::as_i64).unwrap_or(0);
        let msg = body
            .get("msg")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();

        Err(Self::map_error(status.as_u16(), code, msg))
    }

    fn map_error(http: u16, code: i64, msg: String) -> ExchangeError {
        match (http, code) {
            (429, _) | (418, _) => ExchangeError::RateLimit(msg),
            (401, _) | (_, -2014) | (_, -2015) | (_, -1022) => ExchangeError::Auth(msg),
            (_, -2010) if msg.to_lowercase().contains("insufficient") => {
                ExchangeError::InsufficientFunds(msg)
            }
            (_, -2010) | (_, -1013) | (_, -1111) | (_, -1121) | (_, -2011) => {
                ExchangeError::InvalidOrder(msg)
            }
            (s, _) if s >= 500 => ExchangeError::Network(msg),
            _ => ExchangeError::Exchange(msg),
        }
    }

    fn native_type(&self, order_type: OrderType) -> &'static str {
        match (self.market_type, order_type) {
            (_, OrderType::Market) => "MARKET",
            (_, OrderType::Limit) => "LIMIT",
            (MarketType::Futures, OrderType::StopLimit) => "STOP",
            (MarketType::Futures, OrderType::StopMarket) => "STOP_MARKET",
            (_, OrderType::StopLimit) => "STOP_LOSS_LIMIT",
            (_, OrderType::StopMarket) => "STOP_LOSS",
        }
    }

    fn map_status(raw: &str) -> OrderStatus {
        match raw {
            "NEW" => OrderStatus::Open,
            "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
            "FILLED" => OrderStatus::Filled,
            "CANCELED" | "PENDING_CANCEL" => OrderStatus::Cancelled,
            "REJECTED" => OrderStatus::Rejected,
            "EXPIRED" | "EXPIRED_IN_MATCH" => OrderStatus::Expired,
            _ => OrderStatus::Open,
        }
    }

    fn parse_decimal(v: &Value, key: &str) -> Decimal {
        v.get(key)
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or(Decimal::ZERO)
    }

    fn order_from_json(&self, v: &Value) -> ExchangeOrder {
        let native_symbol = v.get("symbol").and_then(Value::as_str).unwrap_or_default();
        let side = match v.get("side").and_then(Value::as_str) {
            Some("SELL") => Side::Sell,
            _ => Side::Buy,
        };
        let order_type = match v.get("type").and_then(Value::as_str) {
            Some("MARKET") => OrderType::Market,
            Some("STOP") | Some("STOP_LOSS_LIMIT") => OrderType::StopLimit,
            Some("STOP_MARKET") | Some("STOP_LOSS") => OrderType::StopMarket,
            _ => OrderType::Limit,
        };
        let price = Self::parse_decimal(v, "price");
        let executed = Self::parse_decimal(v, "executedQty");
        let cummulative = Self::parse_decimal(v, "cummulativeQuoteQty");
        let avg_price = if executed.is_zero() {
            None
        } else {
            Some(cummulative / executed)
        };
        ExchangeOrder {
            exchange_order_id: v
                .get("orderId")
                .map(|id| id.to_string())
                .unwrap_or_default(),
            symbol: from_native_symbol(Exchange::Binance, native_symbol),
            side,
            order_type,
            status: Self::map_status(v.get("status").and_then(Value::as_str).unwrap_or("")),
            quantity: Self::parse_decimal(v, "origQty"),
            filled_quantity: executed,
            price: if price.is_zero() { None } else { Some(price) },
            avg_price,
        }
    }

    async fn obtain_listen_key(&self) -> Result<String, ExchangeError> {
        let path = match self.market_type {
            MarketType::Futures => "/fapi/v1/listenKey",
            _ => "/api/v3/userDataStream",
        };
        let _guard = self
            .limiters
            .throttle(Exchange::Binance, EndpointClass::Query)
            .await;
        let response = self
            .client
            .post(format!("{}{}", self.rest_base, path))
            .header("X-MBX-APIKEY", &self.creds.api_key)
            .send()
            .await?;
        let body = Self::decode_response(response).await?;
        let key = body
            .get("listenKey")
            .and_then(Value::as_str)
            .ok_or_else(|| ExchangeError::Exchange("missing listenKey".to_string()))?
            .to_string();
        *self.listen_key.lock().await = Some(key.clone());
        Ok(key)
    }

    /// Normalize one executionReport into an OrderUpdate.
    fn update_from_execution_report(v: &Value) -> Option<OrderUpdate> {
        if v.get("e").and_then(Value::as_str) != Some("executionReport")
            && v.get("e").and_then(Value::as_str) != Some("ORDER_TRADE_UPDATE")
        {
            return None;
        }

        // Futures wraps the order payload under "o".
        let o = v.get("o").unwrap_or(v);

        let status = Self::map_status(o.get("X").and_then(Value::as_str).unwrap_or(""));
        let exchange_order_id = o.get("i").map(|id| id.to_string())?;
        let native_symbol = o.get("s").and_then(Value::as_str).unwrap_or_default();
        let filled_quantity = Self::parse_decimal(o, "z");

        let last_fill_qty = Self::parse_decimal(o, "l");
        let fill = if last_fill_qty > Decimal::ZERO {
            Some(FillData {
                exchange_trade_id: o.get("t").map(|t| t.to_string()).unwrap_or_default(),
                price: Self::parse_decimal(o, "L"),
                quantity: last_fill_qty,
                commission: Self::parse_decimal(o, "n"),
                commission_asset: o
                    .get("N")
                    .and_then(Value::as_str)
                    .map(|s| s.to_string()),
                is_maker: o.get("m").and_then(Value::as_bool).unwrap_or(false),
            })
        } else {
            None
        };

        Some(OrderUpdate {
            exchange_order_id,
            symbol: from_native_symbol(Exchange::Binance, native_symbol),
            status,
            filled_quantity,
            fill,
        })
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Binance
    }

    async fn create_order(
        &self,
        req: &PlaceOrderRequest,
    ) -> Result<ExchangeOrderAck, ExchangeError> {
        let mut params = vec![
            (
                "symbol".to_string(),
                to_native_symbol(Exchange::Binance, &req.symbol),
            ),
            ("side".to_string(), req.side.as_str().to_string()),
            ("type".to_string(), self.native_type(req.order_type).to_string()),
            ("quantity".to_string(), req.quantity.to_string()),
        ];
        if let Some(price) = req.price {
            params.push(("price".to_string(), price.to_string()));
        }
        if let Some(stop) = req.stop_price {
            params.push(("stopPrice".to_string(), stop.to_string()));
        }
        if matches!(req.order_type, OrderType::Limit | OrderType::StopLimit) {
            params.push(("timeInForce".to_string(), "GTC".to_string()));
        }

        let body = self
            .signed_request(
                reqwest::Method::POST,
                &format!("{}/order", self.api_prefix()),
                params,
                EndpointClass::Order,
            )
            .await?;

        let exchange_order_id = body
            .get("orderId")
            .map(|id| id.to_string())
            .ok_or_else(|| ExchangeError::Exchange("missing orderId in ack".to_string()))?;
        let status = Self::map_status(body.get("status").and_then(Value::as_str).unwrap_or("NEW"));

        Ok(ExchangeOrderAck {
            exchange_order_id,
            status,
        })
    }

    async fn cancel_order(
        &self,
        symbol: &str,
        exchange_order_id: &str,
    ) -> Result<(), ExchangeError> {
        self.signed_request(
            reqwest::Method::DELETE,
            &format!("{}/order", self.api_prefix()),
            vec![
                (
                    "symbol".to_string(),
                    to_native_symbol(Exchange::Binance, symbol),
                ),
                ("orderId".to_string(), exchange_order_id.to_string()),
            ],
            EndpointClass::Order,
        )
        .await?;
        Ok(())
    }

    async fn fetch_order(
        &self,
        symbol: &str,
        exchange_order_id: &str,
    ) -> Result<ExchangeOrder, ExchangeError> {
        let body = self
            .signed_request(
                reqwest::Method::GET,
                &format!("{}/order", self.api_prefix()),
                vec![
                    (
                        "symbol".to_string(),
                        to_native_symbol(Exchange::Binance, symbol),
                    ),
                    ("orderId".to_string(), exchange_order_id.to_string()),
                ],
                EndpointClass::Query,
            )
            .await?;
        Ok(self.order_from_json(&body))
    }

    async fn fetch_open_orders(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        let mut params = Vec::new();
        if let Some(sym) = symbol {
            params.push((
                "symbol".to_string(),
                to_native_symbol(Exchange::Binance, sym),
            ));
        }
        let body = self
            .signed_request(
                reqwest::Method::GET,
                &format!("{}/openOrders", self.api_prefix()),
                params,
                EndpointClass::Query,
            )
            .await?;
        Ok(body
            .as_array()
            .map(|orders| orders.iter().map(|o| self.order_from_json(o)).collect())
            .unwrap_or_default())
    }

    async fn fetch_balance(&self) -> Result<Vec<AssetBalance>, ExchangeError> {
        let (path, list_key) = match self.market_type {
            MarketType::Futures => ("/fapi/v2/balance", None),
            _ => ("/api/v3/account", Some("balances")),
        };
        let body = self
            .signed_request(reqwest::Method::GET, path, Vec::new(), EndpointClass::Query)
            .await?;
        let list = match list_key {
            Some(key) => body.get(key).and_then(Value::as_array).cloned(),
            None => body.as_array().cloned(),
        }
        .unwrap_or_default();

        Ok(list
            .iter()
            .map(|b| AssetBalance {
                asset: b
                    .get("asset")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                free: Self::parse_decimal(b, "free")
                    .max(Self::parse_decimal(b, "availableBalance")),
                locked: Self::parse_decimal(b, "locked"),
            })
            .filter(|b| !b.free.is_zero() || !b.locked.is_zero())
            .collect())
    }

    async fn fetch_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
        if self.market_type != MarketType::Futures {
            return Ok(Vec::new());
        }
        let body = self
            .signed_request(
                reqwest::Method::GET,
                "/fapi/v2/positionRisk",
                Vec::new(),
                EndpointClass::Query,
            )
            .await?;
        Ok(body
            .as_array()
            .map(|positions| {
                positions
                    .iter()
                    .map(|p| ExchangePosition {
                        symbol: from_native_symbol(
                            Exchange::Binance,
                            p.get("symbol").and_then(Value::as_str).unwrap_or_default(),
                        ),
                        quantity: Self::parse_decimal(p, "positionAmt"),
                        entry_price: Self::parse_decimal(p, "entryPrice"),
                        mark_price: Self::parse_decimal(p, "markPrice"),
                        unrealized_pnl: Self::parse_decimal(p, "unRealizedProfit"),
                    })
                    .filter(|p| !p.quantity.is_zero())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        let native = to_native_symbol(Exchange::Binance, symbol);
        let path = match self.market_type {
            MarketType::Futures => "/fapi/v1/ticker/price",
            _ => "/api/v3/ticker/price",
        };
        let body = self
            .public_request(path, &[("symbol", native.as_str())], EndpointClass::Market)
            .await?;
        Ok(Ticker {
            symbol: symbol.to_string(),
            last: Self::parse_decimal(&body, "price"),
        })
    }

    async fn load_markets(&self) -> Result<Vec<(String, SymbolRules)>, ExchangeError> {
        let path = format!("{}/exchangeInfo", self.api_prefix());
        let body = self
            .public_request(&path, &[], EndpointClass::Market)
            .await?;
        let symbols = body
            .get("symbols")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut out = Vec::with_capacity(symbols.len());
        for s in &symbols {
            if s.get("status").and_then(Value::as_str) != Some("TRADING") {
                continue;
            }
            let native = s.get("symbol").and_then(Value::as_str).unwrap_or_default();
            let mut rules = SymbolRules {
                min_qty: Decimal::ZERO,
                max_qty: Decimal::ZERO,
                step_size: Decimal::ZERO,
                min_price: Decimal::ZERO,
                max_price: Decimal::ZERO,
                tick_size: Decimal::ZERO,
                min_notional: Decimal::ZERO,
            };
            for f in s
                .get("filters")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                match f.get("filterType").and_then(Value::as_str) {
                    Some("LOT_SIZE") => {
                        rules.min_qty = Self::parse_decimal(f, "minQty");
                        rules.max_qty = Self::parse_decimal(f, "maxQty");
                        rules.step_size = Self::parse_decimal(f, "stepSize");
                    }
                    Some("PRICE_FILTER") => {
                        rules.min_price = Self::parse_decimal(f, "minPrice");
                        rules.max_price = Self::parse_decimal(f, "maxPrice");
                        rules.tick_size = Self::parse_decimal(f, "tickSize");
                    }
                    Some("NOTIONAL") | Some("MIN_NOTIONAL") => {
                        rules.min_notional = Self::parse_decimal(f, "minNotional")
                            .max(Self::parse_decimal(f, "notional"));
                    }
                    _ => {}
                }
            }
            out.push((from_native_symbol(Exchange::Binance, native), rules));
        }
        Ok(out)
    }

    async fn connect_user_stream(
        &self,
    ) -> Result<mpsc::Receiver<UserStreamEvent>, ExchangeError> {
        let listen_key = self.obtain_listen_key().await?;
        let url = format!("{}/{}", self.ws_base, listen_key);

        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| ExchangeError::Network(format!("user stream connect: {}", e)))?;

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            let (_, mut read) = ws.split();
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        let Ok(value) = serde_json::from_str::<Value>(&text) else {
                            tracing::warn!("Unparseable user stream message, skipping");
                            continue;
                        };
                        if let Some(update) = Self::update_from_execution_report(&value) {
                            if tx.send(UserStreamEvent::Order(update)).await.is_err() {
                                break;
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

    async fn keepalive_user_stream(&self) -> Result<(), ExchangeError> {
        let key = self.listen_key.lock().await.clone();
        let Some(key) = key else { return Ok(()) };
        let path = match self.market_type {
            MarketType::Futures => "/fapi/v1/listenKey".to_string(),
            _ => format!("/api/v3/userDataStream?listenKey={}", key),
        };
        let _guard = self
            .limiters
            .throttle(Exchange::Binance, EndpointClass::Query)
            .await;
        let response = self
            .client
            .put(format!("{}{}", self.rest_base, path))
            .header("X-MBX-APIKEY", &self.creds.api_key)
            .send()
            .await?;
        Self::decode_response(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(BinanceAdapter::map_status("NEW"), OrderStatus::Open);
        assert_eq!(
            BinanceAdapter::map_status("PARTIALLY_FILLED"),
            OrderStatus::PartiallyFilled
        );
        assert_eq!(BinanceAdapter::map_status("FILLED"), OrderStatus::Filled);
        assert_eq!(BinanceAdapter::map_status("CANCELED"), OrderStatus::Cancelled);
        assert_eq!(BinanceAdapter::map_status("EXPIRED"), OrderStatus::Expired);
        assert_eq!(BinanceAdapter::map_status("REJECTED"), OrderStatus::Rejected);
    }

    #[test]
    fn test_error_mapping() {
        assert!(matches!(
            BinanceAdapter::map_error(429, 0, "weight".into()),
            ExchangeError::RateLimit(_)
        ));
        assert!(matches!(
            BinanceAdapter::map_error(400, -2014, "bad key".into()),
            ExchangeError::Auth(_)
        ));
        assert!(matches!(
            BinanceAdapter::map_error(400, -2010, "Account has insufficient balance".into()),
            ExchangeError::InsufficientFunds(_)
        ));
        assert!(matches!(
            BinanceAdapter::map_error(400, -1013, "Filter failure: LOT_SIZE".into()),
            ExchangeError::InvalidOrder(_)
        ));
        assert!(matches!(
            BinanceAdapter::map_error(502, 0, "bad gateway".into()),
            ExchangeError::Network(_)
        ));
    }

    #[test]
    fn test_execution_report_normalization() {
        let raw: Value = serde_json::json!({
            "e": "executionReport",
            "s": "BTCUSDT",
            "i": 12345,
            "X": "FILLED",
            "z": "0.005",
            "l": "0.005",
            "L": "90000.00",
            "t": 777,
            "n": "0.45",
            "N": "USDT",
            "m": true
        });
        let update = BinanceAdapter::update_from_execution_report(&raw).unwrap();
        assert_eq!(update.exchange_order_id, "12345");
        assert_eq!(update.symbol, "BTC/USDT");
        assert_eq!(update.status, OrderStatus::Filled);
        let fill = update.fill.unwrap();
        assert_eq!(fill.exchange_trade_id, "777");
        assert!(fill.is_maker);
        assert_eq!(fill.commission_asset.as_deref(), Some("USDT"));
    }

    #[test]
    fn test_non_execution_events_ignored() {
        let raw: Value = serde_json::json!({"e": "outboundAccountPosition"});
        assert!(BinanceAdapter::update_from_execution_report(&raw).is_none());
    }
}
