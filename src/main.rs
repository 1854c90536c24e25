//! signal-relay entry point
//!
//! Startup order matters: configuration, logging, database, exchange
//! registry, catalog warm, event bus, engine, background services, then
//! the HTTP gateway. Shutdown tears the same stack down in reverse.

use std::sync::Arc;
use std::time::Duration;

use signal_relay::config::AppConfig;
use signal_relay::db::{AccountRepo, Database};
use signal_relay::engine::{OrderEngine, Sweeper};
use signal_relay::events::{DbStrategyGate, EventBus};
use signal_relay::exchange::{
    catalog::sleep_until_minute_offset, AdapterRegistry, MarketCatalog, PriceCache, RateLimiters,
    UserStreamManager,
};
use signal_relay::gateway::state::AppState;
use signal_relay::gateway::run_server;
use signal_relay::logging::init_logging;
use signal_relay::orchestrator::Orchestrator;
use signal_relay::queue::QueueScheduler;
use signal_relay::reconcile::FillReconciler;
use signal_relay::router::SignalRouter;
use signal_relay::secrets::EnvSecretStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(AppConfig::from_env());
    let _log_guard = init_logging(&config.log);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        bind_addr = %config.bind_addr,
        "signal-relay starting"
    );

    if config.db_url.is_empty() {
        anyhow::bail!("DB_URL is required");
    }
    let db = Database::connect(&config.db_url).await?;

    // Exchange plumbing.
    let limiters = Arc::new(RateLimiters::new(config.rate_limit_safety));
    let registry = Arc::new(AdapterRegistry::with_defaults(
        Arc::new(EnvSecretStore),
        limiters,
    ));
    let catalog = Arc::new(MarketCatalog::new());
    let price_cache = Arc::new(PriceCache::new(Duration::from_secs(300)));

    // Warm the symbol catalog from every reconcilable account's adapter
    // (one per exchange/market pair is enough; the registry caches).
    {
        let accounts = AccountRepo::all_reconcilable(&db).await.unwrap_or_default();
        let mut seen = std::collections::HashSet::new();
        let mut adapters = Vec::new();
        for account in &accounts {
            if seen.insert((account.exchange, account.market_type)) {
                if let Ok(adapter) = registry.adapter_for(account) {
                    adapters.push(adapter);
                }
            }
        }
        catalog.warm(&adapters).await;
        tracing::info!(symbols = catalog.len(), "Symbol catalog warmed");
    }

    // Event bus gated on strategy activity.
    let bus = Arc::new(EventBus::new(
        Arc::new(DbStrategyGate::new(db.clone())),
        config.sse_max_queue,
        config.sse_history,
    ));

    // Trading core.
    let engine = Arc::new(OrderEngine::new(db.clone(), registry.clone(), bus.clone()));
    let scheduler = Arc::new(QueueScheduler::new(
        db.clone(),
        engine.clone(),
        config.stop_allocation_ratio,
    ));
    let sweeper = Arc::new(Sweeper::new(
        db.clone(),
        registry.clone(),
        config.stuck_threshold(),
    ));

    // User-data streams feed the reconciler through one channel.
    let (stream_tx, stream_rx) = tokio::sync::mpsc::channel(1024);
    let streams = Arc::new(UserStreamManager::new(registry.clone(), stream_tx));
    let reconciler = Arc::new(FillReconciler::new(
        db.clone(),
        registry.clone(),
        bus.clone(),
        price_cache.clone(),
    ));
    tokio::spawn(reconciler.clone().run(stream_rx));

    let orchestrator = Arc::new(Orchestrator::new(
        db.clone(),
        engine.clone(),
        registry.clone(),
        catalog.clone(),
        price_cache.clone(),
        bus.clone(),
        streams.clone(),
        config.stop_allocation_ratio,
    ));
    let router = Arc::new(SignalRouter::new(db.clone(), config.max_batch_orders));

    // ==========================================================================
    // Background timers. Intervals are prime/odd on purpose: 29/31/307
    // never align into a top-of-minute burst.
    // ==========================================================================
    let mut tasks = Vec::new();

    {
        let scheduler = scheduler.clone();
        let period = config.queue_rebalance;
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                scheduler.run_cycle().await;
            }
        }));
    }

    {
        let reconciler = reconciler.clone();
        let sweeper = sweeper.clone();
        let period = config.open_order_poll;
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                reconciler.poll_cycle().await;
                // The orphan sweep rides the same cycle.
                if let Err(e) = sweeper.run_once().await {
                    tracing::error!(error = %e, "Sweep cycle failed");
                }
            }
        }));
    }

    {
        let reconciler = reconciler.clone();
        let period = config.price_refresh;
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                reconciler.refresh_prices().await;
            }
        }));
    }

    {
        let reconciler = reconciler.clone();
        let period = config.pnl_refresh;
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                reconciler.refresh_marks().await;
            }
        }));
    }

    {
        let bus = bus.clone();
        let scheduler = scheduler.clone();
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                tick.tick().await;
                bus.reap();
                scheduler.reap_locks();
            }
        }));
    }

    {
        let catalog = catalog.clone();
        let registry = registry.clone();
        let db = db.clone();
        let minute_offset = config.catalog_refresh.minute_offset;
        tasks.push(tokio::spawn(async move {
            loop {
                sleep_until_minute_offset(minute_offset).await;
                let accounts = AccountRepo::all_reconcilable(&db).await.unwrap_or_default();
                let mut seen = std::collections::HashSet::new();
                for account in &accounts {
                    if seen.insert((account.exchange, account.market_type)) {
                        if let Ok(adapter) = registry.adapter_for(account) {
                            if let Err(e) = catalog.refresh_from(&adapter).await {
                                tracing::warn!(
                                    exchange = %account.exchange,
                                    error = %e,
                                    "Catalog refresh failed"
                                );
                            }
                        }
                    }
                }
            }
        }));
    }

    // ==========================================================================
    // HTTP gateway
    // ==========================================================================
    let state = Arc::new(AppState {
        config: config.clone(),
        db,
        router,
        orchestrator,
        engine,
        bus,
        registry,
        catalog,
        price_cache,
        streams: streams.clone(),
    });

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutdown signal received");
    };
    run_server(state, shutdown).await?;

    // Reverse teardown: stop timers, close exchange streams. SSE queues
    // end when the bus's senders drop with the state.
    for task in &tasks {
        task.abort();
    }
    streams.shutdown_all();
    tracing::info!("signal-relay stopped");
    Ok(())
}
