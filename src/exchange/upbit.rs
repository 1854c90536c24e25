//! Upbit adapter (KRW spot)
//!
//! Authentication is a JWT (HS256) whose payload carries the access key,
//! a uuid nonce and - when the request has parameters - a SHA512 hash of
//! the query string. Precision is rule-driven: the KRW tick ladder, not
//! a per-symbol filter API. All requests run through the sequential
//! pacer; Upbit bans concurrent bursts outright.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use jsonwebtoken::{encode, EncodingKey, Header};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha512};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use super::catalog::krw_tick_for_price;
use super::{
    from_native_symbol, to_native_symbol, AssetBalance, EndpointClass, ExchangeAdapter,
    ExchangeError, ExchangeOrder, ExchangeOrderAck, ExchangePosition, FillData, OrderUpdate,
    PlaceOrderRequest, RateLimiters, SymbolRules, Ticker, UserStreamEvent,
};
use crate::models::{Exchange, OrderStatus, OrderType, Side};
use crate::secrets::ApiCredentials;

const REST_BASE: &str = "https://api.upbit.com";
const WS_PRIVATE: &str = "wss://api.upbit.com/websocket/v1/private";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize)]
struct UpbitClaims {
    access_key: String,
    nonce: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    query_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    query_hash_alg: Option<String>,
}

pub struct UpbitAdapter {
    creds: ApiCredentials,
    client: reqwest::Client,
    limiters: Arc<RateLimiters>,
}

impl UpbitAdapter {
    pub fn new(creds: ApiCredentials, limiters: Arc<RateLimiters>) -> Self {
        Self {
            creds,
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            limiters,
        }
    }

    fn auth_token(&self, query: Option<&str>) -> Result<String, ExchangeError> {
        let (query_hash, query_hash_alg) = match query {
            Some(q) if !q.is_empty() => {
                let mut hasher = Sha512::new();
                hasher.update(q.as_bytes());
                (Some(hex::encode(hasher.finalize())), Some("SHA512".to_string()))
            }
            _ => (None, None),
        };
        let claims = UpbitClaims {
            access_key: self.creds.api_key.clone(),
            nonce: Uuid::new_v4().to_string(),
            query_hash,
            query_hash_alg,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.creds.api_secret.as_bytes()),
        )
        .map_err(|e| ExchangeError::Auth(format!("jwt encode: {}", e)))
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        query: Option<String>,
        class: EndpointClass,
    ) -> Result<Value, ExchangeError> {
        // Guard held across the whole request: one in flight at a time.
        let _guard = self.limiters.throttle(Exchange::Upbit, class).await;

        let token = self.auth_token(query.as_deref())?;
        let url = match &query {
            Some(q) if !q.is_empty() => format!("{}{}?{}", REST_BASE, path, q),
            _ => format!("{}{}", REST_BASE, path),
        };
        let response = self
            .client
            .request(method, &url)
            .header("Authorization", format!("Bearer {}", token))
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

        if (200..300).contains(&http) {
            return Ok(body);
        }

        let name = body
            .pointer("/error/name")
            .and_then(Value::as_str)
            .unwrap_or("");
        let msg = body
            .pointer("/error/message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        Err(Self::map_error(http, name, msg))
    }

    fn map_error(http: u16, name: &str, msg: String) -> ExchangeError {
        match (http, name) {
            (429, _) => ExchangeError::RateLimit(msg),
            (401, _) | (_, "invalid_access_key") | (_, "jwt_verification") => {
                ExchangeError::Auth(msg)
            }
            (_, "insufficient_funds_bid") | (_, "insufficient_funds_ask") => {
                ExchangeError::InsufficientFunds(msg)
            }
            (_, "under_min_total_bid") | (_, "under_min_total_ask")
            | (_, "invalid_price_bid") | (_, "invalid_volume_bid") => {
                ExchangeError::InvalidOrder(msg)
            }
            (s, _) if s >= 500 => ExchangeError::Network(msg),
            _ => ExchangeError::Exchange(msg),
        }
    }

    fn map_state(raw: &str) -> OrderStatus {
        match raw {
            "wait" | "watch" => OrderStatus::Open,
            "done" => OrderStatus::Filled,
            "cancel" => OrderStatus::Cancelled,
            _ => OrderStatus::Open,
        }
    }

    fn parse_decimal(v: &Value, key: &str) -> Decimal {
        match v.get(key) {
            Some(Value::String(s)) => s.parse().unwrap_or(Decimal::ZERO),
            Some(Value::Number(n)) => n.to_string().parse().unwrap_or(Decimal::ZERO),
            _ => Decimal::ZERO,
        }
    }

    fn order_from_json(v: &Value) -> ExchangeOrder {
        let market = v.get("market").and_then(Value::as_str).unwrap_or_default();
        let side = match v.get("side").and_then(Value::as_str) {
            Some("ask") => Side::Sell,
            _ => Side::Buy,
        };
        let order_type = match v.get("ord_type").and_then(Value::as_str) {
            Some("price") | Some("market") => OrderType::Market,
            _ => OrderType::Limit,
        };
        let volume = Self::parse_decimal(v, "volume");
        let remaining = Self::parse_decimal(v, "remaining_volume");
        let price = Self::parse_decimal(v, "price");
        let state = v.get("state").and_then(Value::as_str).unwrap_or("");

        let mut status = Self::map_state(state);
        let filled = volume - remaining;
        if status == OrderStatus::Open && filled > Decimal::ZERO {
            status = OrderStatus::PartiallyFilled;
        }

        ExchangeOrder {
            exchange_order_id: v
                .get("uuid")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            symbol: from_native_symbol(Exchange::Upbit, market),
            side,
            order_type,
            status,
            quantity: volume,
            filled_quantity: filled,
            price: if price.is_zero() { None } else { Some(price) },
            avg_price: None,
        }
    }

    fn update_from_my_order(v: &Value) -> Option<OrderUpdate> {
        if v.get("type").and_then(Value::as_str) != Some("myOrder") {
            return None;
        }
        let market = v.get("code").and_then(Value::as_str).unwrap_or_default();
        let state = v.get("state").and_then(Value::as_str).unwrap_or("");
        let mut status = Self::map_state(state);
        let executed = Self::parse_decimal(v, "executed_volume");
        if status == OrderStatus::Open && executed > Decimal::ZERO {
            status = OrderStatus::PartiallyFilled;
        }

        let trade_uuid = v.get("trade_uuid").and_then(Value::as_str);
        let fill = trade_uuid.map(|tid| FillData {
            exchange_trade_id: tid.to_string(),
            price: Self::parse_decimal(v, "price"),
            quantity: Self::parse_decimal(v, "trade_volume"),
            commission: Self::parse_decimal(v, "trade_fee"),
            commission_asset: Some("KRW".to_string()),
            is_maker: v.get("is_maker").and_then(Value::as_bool).unwrap_or(false),
        });

        Some(OrderUpdate {
            exchange_order_id: v
                .get("uuid")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            symbol: from_native_symbol(Exchange::Upbit, market),
            status,
            filled_quantity: executed,
            fill,
        })
    }
}

#[async_trait]
impl ExchangeAdapter for UpbitAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Upbit
    }

    async fn create_order(
        &self,
        req: &PlaceOrderRequest,
    ) -> Result<ExchangeOrderAck, ExchangeError> {
        // Upbit has no server-side stop orders on this endpoint.
        if req.order_type.is_stop() {
            return Err(ExchangeError::InvalidOrder(
                "stop orders are not supported on upbit".to_string(),
            ));
        }

        let market = to_native_symbol(Exchange::Upbit, &req.symbol);
        let mut pairs: Vec<(String, String)> = vec![
            ("market".to_string(), market),
            (
                "side".to_string(),
                match req.side {
                    Side::Buy => "bid".to_string(),
                    Side::Sell => "ask".to_string(),
                },
            ),
        ];
        match (req.order_type, req.side) {
            (OrderType::Limit, _) => {
                let price = req.price.unwrap_or(Decimal::ZERO);
                pairs.push(("ord_type".to_string(), "limit".to_string()));
                pairs.push(("volume".to_string(), req.quantity.to_string()));
                pairs.push(("price".to_string(), price.to_string()));
            }
            // Market buys spend quote currency; sells give base volume.
            (OrderType::Market, Side::Buy) => {
                let reference = req.price.unwrap_or(Decimal::ZERO);
                pairs.push(("ord_type".to_string(), "price".to_string()));
                pairs.push(("price".to_string(), (req.quantity * reference).to_string()));
            }
            (OrderType::Market, Side::Sell) => {
                pairs.push(("ord_type".to_string(), "market".to_string()));
                pairs.push(("volume".to_string(), req.quantity.to_string()));
            }
            _ => unreachable!("stop orders rejected above"),
        }

        let query: String = pairs
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");

        let body = self
            .request(
                reqwest::Method::POST,
                "/v1/orders",
                Some(query),
                EndpointClass::Order,
            )
            .await?;

        let exchange_order_id = body
            .get("uuid")
            .and_then(Value::as_str)
            .ok_or_else(|| ExchangeError::Exchange("missing uuid in ack".to_string()))?
            .to_string();

        Ok(ExchangeOrderAck {
            exchange_order_id,
            status: OrderStatus::Open,
        })
    }

    async fn cancel_order(
        &self,
        _symbol: &str,
        exchange_order_id: &str,
    ) -> Result<(), ExchangeError> {
        self.request(
            reqwest::Method::DELETE,
            "/v1/order",
            Some(format!("uuid={}", exchange_order_id)),
            EndpointClass::Order,
        )
        .await?;
        Ok(())
    }

    async fn fetch_order(
        &self,
        _symbol: &str,
        exchange_order_id: &str,
    ) -> Result<ExchangeOrder, ExchangeError> {
        let body = self
            .request(
                reqwest::Method::GET,
                "/v1/order",
                Some(format!("uuid={}", exchange_order_id)),
                EndpointClass::Query,
            )
            .await?;
        Ok(Self::order_from_json(&body))
    }

    async fn fetch_open_orders(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        let mut query = "state=wait".to_string();
        if let Some(sym) = symbol {
            query.push_str(&format!(
                "&market={}",
                to_native_symbol(Exchange::Upbit, sym)
            ));
        }
        let body = self
            .request(
                reqwest::Method::GET,
                "/v1/orders",
                Some(query),
                EndpointClass::Query,
            )
            .await?;
        Ok(body
            .as_array()
            .map(|orders| orders.iter().map(Self::order_from_json).collect())
            .unwrap_or_default())
    }

    async fn fetch_balance(&self) -> Result<Vec<AssetBalance>, ExchangeError> {
        let body = self
            .request(
                reqwest::Method::GET,
                "/v1/accounts",
                None,
                EndpointClass::Query,
            )
            .await?;
        Ok(body
            .as_array()
            .map(|accounts| {
                accounts
                    .iter()
                    .map(|a| AssetBalance {
                        asset: a
                            .get("currency")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        free: Self::parse_decimal(a, "balance"),
                        locked: Self::parse_decimal(a, "locked"),
                    })
                    .filter(|b| !b.free.is_zero() || !b.locked.is_zero())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fetch_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
        // Spot only; positions are balances.
        Ok(Vec::new())
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        let _guard = self
            .limiters
            .throttle(Exchange::Upbit, EndpointClass::Market)
            .await;
        let url = format!(
            "{}/v1/ticker?markets={}",
            REST_BASE,
            to_native_symbol(Exchange::Upbit, symbol)
        );
        let response = self.client.get(&url).send().await?;
        let body = Self::decode_response(response).await?;
        let last = body
            .as_array()
            .and_then(|l| l.first())
            .map(|t| Self::parse_decimal(t, "trade_price"))
            .unwrap_or(Decimal::ZERO);
        Ok(Ticker {
            symbol: symbol.to_string(),
            last,
        })
    }

    async fn load_markets(&self) -> Result<Vec<(String, SymbolRules)>, ExchangeError> {
        let _guard = self
            .limiters
            .throttle(Exchange::Upbit, EndpointClass::Market)
            .await;
        let url = format!("{}/v1/market/all", REST_BASE);
        let response = self.client.get(&url).send().await?;
        let body = Self::decode_response(response).await?;
        let markets = body.as_array().cloned().unwrap_or_default();

        let mut out = Vec::new();
        for m in &markets {
            let native = m.get("market").and_then(Value::as_str).unwrap_or_default();
            if !native.starts_with("KRW-") {
                continue;
            }
            let canonical = from_native_symbol(Exchange::Upbit, native);

            // Rule-driven: ticks depend on the price band (snapped at
            // placement time); the static floor values come from the
            // published rate card.
            let rules = SymbolRules {
                min_qty: Decimal::new(1, 8),
                max_qty: Decimal::ZERO,
                step_size: Decimal::new(1, 8),
                min_price: Decimal::ZERO,
                max_price: Decimal::ZERO,
                // Placeholder tick; Upbit placements re-snap with
                // krw_tick_for_price at the actual price level.
                tick_size: krw_tick_for_price(Decimal::ONE),
                min_notional: Decimal::new(5_000, 0), // 5,000 KRW
            };
            out.push((canonical, rules));
        }
        Ok(out)
    }

    async fn connect_user_stream(
        &self,
    ) -> Result<mpsc::Receiver<UserStreamEvent>, ExchangeError> {
        let token = self.auth_token(None)?;
        let mut request = WS_PRIVATE
            .into_client_request()
            .map_err(|e| ExchangeError::Network(format!("ws request: {}", e)))?;
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {}", token)
                .parse()
                .map_err(|_| ExchangeError::Auth("authorization header".to_string()))?,
        );

        let (ws, _) = connect_async(request)
            .await
            .map_err(|e| ExchangeError::Network(format!("user stream connect: {}", e)))?;
        let (mut write, mut read) = ws.split();

        let subscribe = json!([
            {"ticket": Uuid::new_v4().to_string()},
            {"type": "myOrder"},
        ]);
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
                            continue;
                        };
                        if let Some(update) = Self::update_from_my_order(&value) {
                            if tx.send(UserStreamEvent::Order(update)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Ok(Message::Binary(bytes)) => {
                        let Ok(value) = serde_json::from_slice::<Value>(&bytes) else {
                            continue;
                        };
                        if let Some(update) = Self::update_from_my_order(&value) {
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
    fn test_state_mapping() {
        assert_eq!(UpbitAdapter::map_state("wait"), OrderStatus::Open);
        assert_eq!(UpbitAdapter::map_state("done"), OrderStatus::Filled);
        assert_eq!(UpbitAdapter::map_state("cancel"), OrderStatus::Cancelled);
    }

    #[test]
    fn test_error_mapping() {
        assert!(matches!(
            UpbitAdapter::map_error(400, "insufficient_funds_bid", "x".into()),
            ExchangeError::InsufficientFunds(_)
        ));
        assert!(matches!(
            UpbitAdapter::map_error(401, "", "x".into()),
            ExchangeError::Auth(_)
        ));
        assert!(matches!(
            UpbitAdapter::map_error(429, "", "x".into()),
            ExchangeError::RateLimit(_)
        ));
        assert!(matches!(
            UpbitAdapter::map_error(400, "under_min_total_bid", "x".into()),
            ExchangeError::InvalidOrder(_)
        ));
    }

    #[test]
    fn test_order_normalization_partial_fill() {
        let raw = json!({
            "uuid": "ord-1",
            "market": "KRW-BTC",
            "side": "bid",
            "ord_type": "limit",
            "state": "wait",
            "volume": "0.01",
            "remaining_volume": "0.004",
            "price": "90000000"
        });
        let order = UpbitAdapter::order_from_json(&raw);
        assert_eq!(order.symbol, "BTC/KRW");
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        assert_eq!(order.filled_quantity, "0.006".parse().unwrap());
    }

    #[test]
    fn test_my_order_event() {
        let raw = json!({
            "type": "myOrder",
            "code": "KRW-BTC",
            "uuid": "ord-9",
            "state": "done",
            "executed_volume": "0.01",
            "trade_uuid": "t-44",
            "price": "90000000",
            "trade_volume": "0.01",
            "trade_fee": "45",
            "is_maker": true
        });
        let update = UpbitAdapter::update_from_my_order(&raw).unwrap();
        assert_eq!(update.status, OrderStatus::Filled);
        assert_eq!(update.fill.unwrap().exchange_trade_id, "t-44");
    }
}
