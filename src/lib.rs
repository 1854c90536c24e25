//! signal-relay - Webhook-driven multi-account trading gateway
//!
//! External signal sources push HTTP webhooks naming a strategy and an
//! order intent. The gateway fans the intent out to every account
//! subscribed to that strategy, sizes each order against per-account
//! capital, keeps the most valuable orders live on each exchange through
//! a reorderable queue, and tracks every resulting order over exchange
//! user-data streams with REST reconciliation as the fallback.
//!
//! # Modules
//!
//! - [`config`] - Environment-driven runtime configuration
//! - [`models`] - Domain entities and the order status machine
//! - [`db`] - PostgreSQL repositories (DB-first order state)
//! - [`exchange`] - Exchange adapters, symbol catalog, rate limiting
//! - [`events`] - Per-(user, strategy) SSE event bus
//! - [`engine`] - Order create/cancel engine, sizing, orphan sweeps
//! - [`queue`] - Active/pending queue scheduler
//! - [`reconcile`] - WebSocket-first fill reconciliation
//! - [`orchestrator`] - Per-account fan-out
//! - [`router`] - Webhook normalization, auth, batch split
//! - [`gateway`] - HTTP surface (axum)

// Leaf utilities - must be first!
pub mod config;
pub mod logging;
pub mod sanitize;
pub mod secrets;

// Domain model
pub mod models;

// Persistence
pub mod db;

// Exchange integration
pub mod exchange;

// Live event fan-out
pub mod events;

// Trading core
pub mod engine;
pub mod orchestrator;
pub mod queue;
pub mod reconcile;
pub mod router;

// HTTP surface
pub mod gateway;

// Convenient re-exports at crate root
pub use config::AppConfig;
pub use db::Database;
pub use events::EventBus;
pub use models::{
    Exchange, MarketType, Order, OrderStatus, OrderType, PendingOrder, Position, Side, Strategy,
    StrategyAccount, Trade, TradeExecution,
};
