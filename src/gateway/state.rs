//! Gateway application state (shared)

use std::sync::Arc;

use crate::config::AppConfig;
use crate::db::Database;
use crate::engine::OrderEngine;
use crate::events::EventBus;
use crate::exchange::{AdapterRegistry, MarketCatalog, PriceCache, UserStreamManager};
use crate::orchestrator::Orchestrator;
use crate::router::SignalRouter;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: Database,
    pub router: Arc<SignalRouter>,
    pub orchestrator: Arc<Orchestrator>,
    pub engine: Arc<OrderEngine>,
    pub bus: Arc<EventBus>,
    pub registry: Arc<AdapterRegistry>,
    pub catalog: Arc<MarketCatalog>,
    pub price_cache: Arc<PriceCache>,
    pub streams: Arc<UserStreamManager>,
}

/// Authenticated caller, injected by the auth middleware.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: i64,
}
