//! Order-fill reconciliation
//!
//! Two ingestion paths converge on the same target: database state equals
//! authoritative exchange state.
//!
//! - WebSocket (primary, sub-second): normalized order updates from the
//!   stream manager, one short DB scope per message, terminal
//!   transitions verified with one REST fetch before acceptance.
//! - REST poll (fallback, ~29s per account): diff exchange open orders
//!   against the database and settle whatever the stream missed.
//!
//! Fill accounting is at-most-once: `exchange_trade_id` is unique and
//! duplicate inserts are silently absorbed.

use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::db::trades::{apply_fill_math, Fill, TradeRepo};
use crate::db::{AccountRepo, Database, DbError, OrderContext, OrderRepo};
use crate::events::{
    order_event_data, position_event_data, EventBus, EventType, OrderEventKind, PositionEventKind,
};
use crate::exchange::{
    AdapterRegistry, ExchangeError, ExchangeOrder, FillData, OrderUpdate, PriceCache,
    UserStreamEvent,
};
use crate::models::{Account, Id, Order, OrderStatus};

const VERIFY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct FillReconciler {
    db: Database,
    registry: Arc<AdapterRegistry>,
    bus: Arc<EventBus>,
    price_cache: Arc<PriceCache>,
}

impl FillReconciler {
    pub fn new(
        db: Database,
        registry: Arc<AdapterRegistry>,
        bus: Arc<EventBus>,
        price_cache: Arc<PriceCache>,
    ) -> Self {
        Self {
            db,
            registry,
            bus,
            price_cache,
        }
    }

    /// Consume the merged user-stream channel. One bad message is logged
    /// and skipped; it never kills the stream.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<(Id, UserStreamEvent)>) {
        tracing::info!("Fill reconciler started");
        while let Some((account_id, event)) = events.recv().await {
            match event {
                UserStreamEvent::Order(update) => {
                    if let Err(e) = self.process_update(account_id, &update).await {
                        tracing::warn!(
                            account_id,
                            exchange_order_id = %update.exchange_order_id,
                            error = %e,
                            "Stream update skipped"
                        );
                    }
                }
                UserStreamEvent::Disconnected { reason } => {
                    tracing::warn!(account_id, %reason, "User stream reported disconnect");
                }
            }
        }
        tracing::info!("Fill reconciler stopped");
    }

    /// Apply one stream update. Terminal claims are only trusted after a
    /// REST verification; on failure the poll cycle settles it later.
    pub async fn process_update(
        &self,
        account_id: Id,
        update: &OrderUpdate,
    ) -> Result<(), DbError> {
        if update.status.is_terminal() && !self.verify_terminal(account_id, update).await {
            tracing::debug!(
                exchange_order_id = %update.exchange_order_id,
                "Terminal update unverified; deferring to poll"
            );
            return Ok(());
        }
        self.apply(update).await
    }

    /// The single transactional convergence step: lock the row, apply
    /// the legal status/fill transition, account the fill, update the
    /// position, drop the row on terminal, then emit events after the
    /// commit.
    async fn apply(&self, update: &OrderUpdate) -> Result<(), DbError> {
        let mut tx = self.db.pool().begin().await.map_err(DbError::Sqlx)?;
        let Some((order, ctx)) =
            OrderRepo::lock_with_context(&mut *tx, &update.exchange_order_id).await?
        else {
            // Unknown order, or locked by the other path. Strays are
            // adopted by the poll diff.
            return Ok(());
        };

        let new_status = if order.status.can_transition_to(update.status) {
            update.status
        } else {
            order.status
        };
        let new_filled = order.filled_quantity.max(update.filled_quantity);

        let mut position_event = None;
        if let Some(fill_data) = &update.fill {
            let fill = Fill {
                exchange_trade_id: fill_data.exchange_trade_id.clone(),
                exchange_order_id: update.exchange_order_id.clone(),
                symbol: order.symbol.clone(),
                side: order.side,
                price: fill_data.price,
                quantity: fill_data.quantity,
                commission: fill_data.commission,
                commission_asset: fill_data.commission_asset.clone(),
                is_maker: fill_data.is_maker,
            };

            let position = TradeRepo::position_for_update(
                &mut *tx,
                order.strategy_account_id,
                &order.symbol,
            )
            .await?;
            let (pos_qty, pos_entry) = position
                .as_ref()
                .map(|p| (p.quantity, p.entry_price))
                .unwrap_or((Decimal::ZERO, Decimal::ZERO));
            let delta = apply_fill_math(pos_qty, pos_entry, order.side, fill.quantity, fill.price);

            // The unique index absorbs replays; the trade aggregate and
            // position only move when this execution is new.
            let inserted = TradeRepo::record_execution(
                &mut *tx,
                order.strategy_account_id,
                &fill,
                delta.realized_pnl,
            )
            .await?;
            if inserted {
                TradeRepo::upsert_trade(
                    &mut *tx,
                    order.strategy_account_id,
                    order.order_type,
                    &fill,
                    delta.realized_pnl,
                )
                .await?;
                TradeRepo::upsert_position(
                    &mut *tx,
                    order.strategy_account_id,
                    &order.symbol,
                    &delta,
                    fill.price,
                )
                .await?;

                let kind = if delta.new_quantity.is_zero() {
                    PositionEventKind::Closed
                } else if pos_qty.is_zero() {
                    PositionEventKind::Created
                } else {
                    PositionEventKind::Updated
                };
                position_event = Some((kind, delta.new_quantity, delta.new_entry_price));
            }
        }

        if new_status.is_terminal() {
            // Settled rows leave the working set; history lives in
            // trades_tb / trade_executions_tb.
            OrderRepo::delete_tx(&mut *tx, order.order_id).await?;
        } else if new_filled != order.filled_quantity || new_status != order.status {
            OrderRepo::update_fill_tx(&mut *tx, order.order_id, new_filled, new_status).await?;
        }

        tx.commit().await.map_err(DbError::Sqlx)?;

        self.emit_after_update(&order, &ctx, new_status, new_filled, update, position_event)
            .await;
        Ok(())
    }

    async fn emit_after_update(
        &self,
        order: &Order,
        ctx: &OrderContext,
        new_status: OrderStatus,
        new_filled: Decimal,
        update: &OrderUpdate,
        position_event: Option<(PositionEventKind, Decimal, Decimal)>,
    ) {
        let mut updated = order.clone();
        updated.status = new_status;
        updated.filled_quantity = new_filled;

        let kind = match new_status {
            OrderStatus::Filled => OrderEventKind::Filled,
            OrderStatus::Cancelled => OrderEventKind::Cancelled,
            _ if update.fill.is_some() => OrderEventKind::TradeExecuted,
            _ => OrderEventKind::Updated,
        };
        self.bus
            .emit(
                ctx.strategy_id,
                EventType::OrderUpdate,
                order_event_data(kind, &updated, ctx),
            )
            .await;

        if let Some((pos_kind, quantity, entry_price)) = position_event {
            self.bus
                .emit(
                    ctx.strategy_id,
                    EventType::PositionUpdate,
                    position_event_data(pos_kind, &order.symbol, quantity, entry_price, ctx),
                )
                .await;
        }
    }

    /// One REST fetch with a 5s budget confirming a terminal stream
    /// claim. Missing order counts as confirmation (settled and aged out
    /// server-side).
    async fn verify_terminal(&self, account_id: Id, update: &OrderUpdate) -> bool {
        let Ok(Some(account)) = AccountRepo::find_by_id(&self.db, account_id).await else {
            return false;
        };
        let Ok(adapter) = self.registry.adapter_for(&account) else {
            return false;
        };

        match tokio::time::timeout(
            VERIFY_TIMEOUT,
            adapter.fetch_order(&update.symbol, &update.exchange_order_id),
        )
        .await
        {
            Ok(Ok(remote)) => remote.status.is_terminal(),
            Ok(Err(ExchangeError::Exchange(_))) => true, // not found: already settled
            Ok(Err(_)) => false,
            Err(_) => false,
        }
    }

    // ========================================================================
    // REST fallback
    // ========================================================================

    /// Diff every reconcilable account against the exchange.
    pub async fn poll_cycle(&self) {
        let accounts = match AccountRepo::all_reconcilable(&self.db).await {
            Ok(a) => a,
            Err(e) => {
                tracing::error!(error = %e, "Poll cycle account scan failed");
                return;
            }
        };
        for account in &accounts {
            if let Err(e) = self.poll_account(account).await {
                tracing::warn!(account_id = account.account_id, error = %e, "Poll cycle failed");
            }
        }
    }

    async fn poll_account(&self, account: &Account) -> Result<(), DbError> {
        let adapter = match self.registry.adapter_for(account) {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!(account_id = account.account_id, error = %e, "No adapter");
                return Ok(());
            }
        };

        let remote = match adapter.fetch_open_orders(None).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(account_id = account.account_id, error = %e, "Open-order fetch failed");
                return Ok(());
            }
        };
        let local = OrderRepo::active_for_account(&self.db, account.account_id).await?;

        // Exchange-only: a PENDING row whose acknowledgement was lost.
        // Match by placement shape and replace the marker with the real
        // id; unattributable orders (placed outside this system) are
        // left alone - strategy isolation forbids guessing an owner.
        for r in &remote {
            if local
                .iter()
                .any(|o| o.exchange_order_id == r.exchange_order_id)
            {
                continue;
            }
            if let Some(pending) = local.iter().find(|o| {
                o.status == OrderStatus::Pending
                    && o.symbol == r.symbol
                    && o.side == r.side
                    && o.quantity == r.quantity
            }) {
                let adopted =
                    OrderRepo::mark_open(&self.db, pending.order_id, &r.exchange_order_id).await?;
                if adopted {
                    tracing::info!(
                        order_id = pending.order_id,
                        exchange_order_id = %r.exchange_order_id,
                        "Lost acknowledgement recovered by poll"
                    );
                }
            }
        }

        // Local-only non-terminal rows and fill drift.
        for order in &local {
            if order.status == OrderStatus::Pending {
                continue; // the sweeper owns PENDING
            }
            match remote
                .iter()
                .find(|r| r.exchange_order_id == order.exchange_order_id)
            {
                Some(r) => {
                    if r.filled_quantity > order.filled_quantity {
                        self.settle_from_snapshot(order, r).await?;
                    }
                }
                None => {
                    // Not in the open set: fetch the final state.
                    match adapter
                        .fetch_order(&order.symbol, &order.exchange_order_id)
                        .await
                    {
                        Ok(r)
                            if r.status.is_terminal()
                                || r.filled_quantity > order.filled_quantity =>
                        {
                            self.settle_from_snapshot(order, &r).await?;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::debug!(
                                order_id = order.order_id,
                                error = %e,
                                "Order re-fetch failed; retrying next cycle"
                            );
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Convert a REST snapshot into the same convergence step a stream
    /// update takes. No re-verification: the snapshot IS the REST
    /// answer. The synthesized trade id is deterministic per (order,
    /// cumulative fill), so replays of the same drift are absorbed by
    /// the unique index.
    async fn settle_from_snapshot(
        &self,
        order: &Order,
        remote: &ExchangeOrder,
    ) -> Result<(), DbError> {
        let missing = remote.filled_quantity - order.filled_quantity;
        let fill = if missing > Decimal::ZERO {
            Some(FillData {
                exchange_trade_id: format!(
                    "poll-{}-{}",
                    remote.exchange_order_id, remote.filled_quantity
                ),
                price: remote.avg_price.or(remote.price).unwrap_or(Decimal::ZERO),
                quantity: missing,
                commission: Decimal::ZERO,
                commission_asset: None,
                is_maker: false,
            })
        } else {
            None
        };

        let update = OrderUpdate {
            exchange_order_id: remote.exchange_order_id.clone(),
            symbol: remote.symbol.clone(),
            status: remote.status,
            filled_quantity: remote.filled_quantity,
            fill,
        };
        self.apply(&update).await
    }

    // ========================================================================
    // Periodic refreshers
    // ========================================================================

    /// ~31s: refresh the price cache for every symbol with an active
    /// order.
    pub async fn refresh_prices(&self) {
        let accounts = match AccountRepo::all_reconcilable(&self.db).await {
            Ok(a) => a,
            Err(_) => return,
        };
        for account in &accounts {
            let Ok(adapter) = self.registry.adapter_for(account) else {
                continue;
            };
            let Ok(orders) = OrderRepo::active_for_account(&self.db, account.account_id).await
            else {
                continue;
            };
            let mut symbols: Vec<String> = orders.iter().map(|o| o.symbol.clone()).collect();
            symbols.sort();
            symbols.dedup();
            for symbol in symbols {
                match adapter.fetch_ticker(&symbol).await {
                    Ok(ticker) if !ticker.last.is_zero() => {
                        self.price_cache.set(account.exchange, &symbol, ticker.last);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(%symbol, error = %e, "Ticker refresh failed");
                    }
                }
            }
        }
    }

    /// ~307s: refresh position marks and unrealized PnL.
    pub async fn refresh_marks(&self) {
        let positions = match TradeRepo::open_positions(&self.db).await {
            Ok(p) => p,
            Err(_) => return,
        };
        for position in &positions {
            let Ok(Some(ctx)) =
                OrderRepo::context_for(&self.db, position.strategy_account_id).await
            else {
                continue;
            };
            let Ok(Some(account)) = AccountRepo::find_by_id(&self.db, ctx.account_id).await else {
                continue;
            };
            let Ok(adapter) = self.registry.adapter_for(&account) else {
                continue;
            };
            match adapter.fetch_ticker(&position.symbol).await {
                Ok(ticker) if !ticker.last.is_zero() => {
                    if let Err(e) =
                        TradeRepo::update_mark(&self.db, position.position_id, ticker.last).await
                    {
                        tracing::debug!(
                            position_id = position.position_id,
                            error = %e,
                            "Mark update failed"
                        );
                    }
                }
                _ => {}
            }
        }
    }
}
