//! Live event fan-out
//!
//! In-process pub/sub with per-(user, strategy) isolation: a subscriber
//! queue exists only for a key that passed the permission gate at
//! subscribe time, and emission only ever walks keys of the emitting
//! strategy. Queues are bounded; a subscriber that cannot drain within
//! the put timeout is marked dead and evicted rather than blocking the
//! trading path.

use dashmap::DashMap;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::db::OrderContext;
use crate::models::{Id, Order};

pub mod sse;

/// (user_id, strategy_id) - the isolation key.
pub type BusKey = (Id, Id);

// ============================================================================
// Event model
// ============================================================================

/// SSE event types on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    OrderUpdate,
    PositionUpdate,
    OrderBatchUpdate,
    Connection,
    Heartbeat,
    ForceDisconnect,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::OrderUpdate => "order_update",
            EventType::PositionUpdate => "position_update",
            EventType::OrderBatchUpdate => "order_batch_update",
            EventType::Connection => "connection",
            EventType::Heartbeat => "heartbeat",
            EventType::ForceDisconnect => "force_disconnect",
        }
    }
}

/// `order_update` sub-kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderEventKind {
    Created,
    Updated,
    Filled,
    Cancelled,
    TradeExecuted,
}

impl OrderEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderEventKind::Created => "order_created",
            OrderEventKind::Updated => "order_updated",
            OrderEventKind::Filled => "order_filled",
            OrderEventKind::Cancelled => "order_cancelled",
            OrderEventKind::TradeExecuted => "trade_executed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionEventKind {
    Created,
    Updated,
    Closed,
}

impl PositionEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionEventKind::Created => "position_created",
            PositionEventKind::Updated => "position_updated",
            PositionEventKind::Closed => "position_closed",
        }
    }
}

/// Reasons carried by a `force_disconnect` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    PermissionRevoked,
    StrategyDeleted,
    StrategyPrivatized,
    AccountDeactivated,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::PermissionRevoked => "permission_revoked",
            DisconnectReason::StrategyDeleted => "strategy_deleted",
            DisconnectReason::StrategyPrivatized => "strategy_privatized",
            DisconnectReason::AccountDeactivated => "account_deactivated",
        }
    }
}

/// One frame as delivered to a subscriber queue.
#[derive(Debug, Clone)]
pub struct SseMessage {
    pub event: &'static str,
    pub data: Value,
}

/// Payload builder for order lifecycle events.
pub fn order_event_data(kind: OrderEventKind, order: &Order, ctx: &OrderContext) -> Value {
    json!({
        "event": kind.as_str(),
        "order_id": order.order_id,
        "symbol": order.symbol,
        "status": order.status.as_str(),
        "side": order.side.as_str(),
        "order_type": order.order_type.as_str(),
        "quantity": order.quantity,
        "filled_quantity": order.filled_quantity,
        "account": {
            "account_id": ctx.account_id,
            "name": ctx.account_name,
            "exchange": ctx.exchange.as_str(),
        },
    })
}

/// Payload builder for position events.
pub fn position_event_data(
    kind: PositionEventKind,
    symbol: &str,
    quantity: rust_decimal::Decimal,
    entry_price: rust_decimal::Decimal,
    ctx: &OrderContext,
) -> Value {
    json!({
        "event": kind.as_str(),
        "symbol": symbol,
        "quantity": quantity,
        "entry_price": entry_price,
        "account": {
            "account_id": ctx.account_id,
            "name": ctx.account_name,
            "exchange": ctx.exchange.as_str(),
        },
    })
}

/// One line of an `order_batch_update` summary.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BatchSummary {
    pub order_type: String,
    pub created: usize,
    pub cancelled: usize,
}

// ============================================================================
// Strategy gate
// ============================================================================

/// Activity check consulted on every emit. Injected so the bus never
/// reaches into ambient state.
#[async_trait::async_trait]
pub trait StrategyGate: Send + Sync {
    async fn is_active(&self, strategy_id: Id) -> bool;
}

/// Database-backed gate.
pub struct DbStrategyGate {
    db: crate::db::Database,
}

impl DbStrategyGate {
    pub fn new(db: crate::db::Database) -> Self {
        Self { db }
    }
}

#[async_trait::async_trait]
impl StrategyGate for DbStrategyGate {
    async fn is_active(&self, strategy_id: Id) -> bool {
        crate::db::StrategyRepo::is_active(&self.db, strategy_id)
            .await
            .unwrap_or(false)
    }
}

/// Always-open gate for tests.
pub struct OpenGate;

#[async_trait::async_trait]
impl StrategyGate for OpenGate {
    async fn is_active(&self, _strategy_id: Id) -> bool {
        true
    }
}

// ============================================================================
// The bus
// ============================================================================

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<SseMessage>,
}

pub struct EventBus {
    clients: DashMap<BusKey, Vec<Subscriber>>,
    history: DashMap<BusKey, VecDeque<SseMessage>>,
    gate: Arc<dyn StrategyGate>,
    max_queue: usize,
    history_cap: usize,
    put_timeout: Duration,
    next_subscriber_id: AtomicU64,
}

impl EventBus {
    pub fn new(gate: Arc<dyn StrategyGate>, max_queue: usize, history_cap: usize) -> Self {
        Self {
            clients: DashMap::new(),
            history: DashMap::new(),
            gate,
            max_queue,
            history_cap,
            put_timeout: Duration::from_secs(1),
            next_subscriber_id: AtomicU64::new(1),
        }
    }

    /// Open a subscriber queue for (user, strategy). Permission must have
    /// been checked by the caller; the bus only manages delivery. The
    /// initial `connection` frame is seeded into the queue.
    pub fn subscribe(&self, user_id: Id, strategy_id: Id) -> mpsc::Receiver<SseMessage> {
        let (tx, rx) = mpsc::channel(self.max_queue);
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);

        let _ = tx.try_send(SseMessage {
            event: EventType::Connection.as_str(),
            data: json!({"status": "connected", "strategy_id": strategy_id}),
        });

        self.clients
            .entry((user_id, strategy_id))
            .or_default()
            .push(Subscriber { id, tx });

        tracing::info!(user_id, strategy_id, subscriber = id, "SSE subscriber added");
        rx
    }

    /// Emit one event to every live subscriber of `strategy_id`. Only
    /// keys carrying this exact strategy are walked, so an event for
    /// (U, S) can never surface on a key (U', S') with S' != S; and keys
    /// only exist for users that passed the subscribe-time permission
    /// check.
    pub async fn emit(&self, strategy_id: Id, event: EventType, data: Value) {
        if !self.gate.is_active(strategy_id).await {
            tracing::debug!(strategy_id, "Emit suppressed: strategy inactive");
            return;
        }
        self.distribute(strategy_id, event, data).await;
    }

    /// Emit without the activity gate (terminal frames during teardown).
    async fn distribute(&self, strategy_id: Id, event: EventType, data: Value) {
        let message = SseMessage {
            event: event.as_str(),
            data,
        };

        // Snapshot receivers first; never hold a map shard across an await.
        let mut targets: Vec<(BusKey, u64, mpsc::Sender<SseMessage>)> = Vec::new();
        for entry in self.clients.iter() {
            let (key, subscribers) = entry.pair();
            if key.1 != strategy_id {
                continue;
            }
            for sub in subscribers {
                targets.push((*key, sub.id, sub.tx.clone()));
            }
            self.record_history(*key, &message);
        }

        let mut dead: Vec<(BusKey, u64)> = Vec::new();
        for (key, sub_id, tx) in targets {
            match tokio::time::timeout(self.put_timeout, tx.send(message.clone())).await {
                Ok(Ok(())) => {}
                _ => {
                    tracing::warn!(
                        user_id = key.0,
                        strategy_id = key.1,
                        subscriber = sub_id,
                        "SSE queue stalled; evicting subscriber"
                    );
                    dead.push((key, sub_id));
                }
            }
        }

        for (key, sub_id) in dead {
            self.remove_subscriber(key, sub_id);
        }
    }

    fn record_history(&self, key: BusKey, message: &SseMessage) {
        let mut ring = self.history.entry(key).or_default();
        if ring.len() >= self.history_cap {
            ring.pop_front();
        }
        ring.push_back(message.clone());
    }

    fn remove_subscriber(&self, key: BusKey, subscriber_id: u64) {
        if let Some(mut subs) = self.clients.get_mut(&key) {
            subs.retain(|s| s.id != subscriber_id);
        }
    }

    /// Emit a terminal `force_disconnect` frame to one key and close all
    /// of its queues.
    pub async fn disconnect_all(&self, user_id: Id, strategy_id: Id, reason: DisconnectReason) {
        let key = (user_id, strategy_id);
        let subscribers = match self.clients.remove(&key) {
            Some((_, subs)) => subs,
            None => return,
        };

        let message = SseMessage {
            event: EventType::ForceDisconnect.as_str(),
            data: json!({"reason": reason.as_str()}),
        };
        for sub in &subscribers {
            let _ = tokio::time::timeout(self.put_timeout, sub.tx.send(message.clone())).await;
        }
        // Dropping the senders ends every stream after the terminal frame.
        drop(subscribers);
        self.history.remove(&key);
        tracing::info!(user_id, strategy_id, reason = reason.as_str(), "SSE key disconnected");
    }

    /// Disconnect every key of one strategy (privatized / deleted).
    pub async fn disconnect_strategy(&self, strategy_id: Id, reason: DisconnectReason) {
        let keys: Vec<BusKey> = self
            .clients
            .iter()
            .filter(|e| e.key().1 == strategy_id)
            .map(|e| *e.key())
            .collect();
        for (user_id, _) in keys {
            self.disconnect_all(user_id, strategy_id, reason).await;
        }
    }

    /// 60-second housekeeping: drop empty client sets and history rings
    /// with no live subscribers.
    pub fn reap(&self) {
        self.clients
            .retain(|_, subs| {
                subs.retain(|s| !s.tx.is_closed());
                !subs.is_empty()
            });
        self.history
            .retain(|key, _| self.clients.contains_key(key));
    }

    pub fn subscriber_count(&self, user_id: Id, strategy_id: Id) -> usize {
        self.clients
            .get(&(user_id, strategy_id))
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus() -> EventBus {
        EventBus::new(Arc::new(OpenGate), 8, 10)
    }

    #[tokio::test]
    async fn test_emit_reaches_subscriber() {
        let bus = bus();
        let mut rx = bus.subscribe(1, 100);

        // connection frame first
        assert_eq!(rx.recv().await.unwrap().event, "connection");

        bus.emit(100, EventType::OrderUpdate, json!({"order_id": 1}))
            .await;
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.event, "order_update");
        assert_eq!(msg.data["order_id"], 1);
    }

    #[tokio::test]
    async fn test_isolation_across_keys() {
        let bus = bus();
        let mut owner = bus.subscribe(1, 100);
        let mut other_strategy = bus.subscribe(1, 200);
        let mut other_user = bus.subscribe(2, 100);

        owner.recv().await.unwrap();
        other_strategy.recv().await.unwrap();
        other_user.recv().await.unwrap();

        bus.emit(100, EventType::OrderUpdate, json!({"n": 1})).await;

        // Both keys under strategy 100 see it...
        assert_eq!(owner.recv().await.unwrap().event, "order_update");
        assert_eq!(other_user.recv().await.unwrap().event, "order_update");
        // ...the unrelated strategy's queue stays empty.
        assert!(other_strategy.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_force_disconnect_closes_stream() {
        let bus = bus();
        let mut rx = bus.subscribe(1, 100);
        rx.recv().await.unwrap();

        bus.disconnect_all(1, 100, DisconnectReason::PermissionRevoked)
            .await;

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.event, "force_disconnect");
        assert_eq!(frame.data["reason"], "permission_revoked");
        // Channel closed after the terminal frame.
        assert!(rx.recv().await.is_none());
        assert_eq!(bus.subscriber_count(1, 100), 0);
    }

    #[tokio::test]
    async fn test_stalled_subscriber_evicted() {
        let mut bus = bus();
        bus.put_timeout = Duration::from_millis(20);
        let bus = bus;

        let _rx = {
            // Fill the queue and never drain it.
            let rx = bus.subscribe(1, 100);
            for _ in 0..10 {
                bus.emit(100, EventType::Heartbeat, json!({})).await;
            }
            rx
        };
        // Queue of 8 is full (connection + 7 heartbeats); the next emit
        // times out and evicts.
        assert_eq!(bus.subscriber_count(1, 100), 0);
    }

    #[tokio::test]
    async fn test_inactive_strategy_suppresses_emit() {
        struct ClosedGate;
        #[async_trait::async_trait]
        impl StrategyGate for ClosedGate {
            async fn is_active(&self, _: Id) -> bool {
                false
            }
        }

        let bus = EventBus::new(Arc::new(ClosedGate), 8, 10);
        let mut rx = bus.subscribe(1, 100);
        rx.recv().await.unwrap();

        bus.emit(100, EventType::OrderUpdate, json!({})).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reaper_drops_dead_keys() {
        let bus = bus();
        let rx = bus.subscribe(1, 100);
        drop(rx);
        bus.reap();
        assert_eq!(bus.subscriber_count(1, 100), 0);
        assert!(bus.history.is_empty());
    }
}
