//! Active/pending queue scheduler
//!
//! Once per second, every (account, symbol) key touched by an active or
//! queued order is re-ranked: the most valuable orders per side hold the
//! exchange's limited slots, the rest wait locally. BUYs with higher
//! bids win; SELLs with lower asks win (the SELL sort key is `-price`,
//! so one `sort_price DESC` ordering serves both sides). STOP orders are
//! confined to a sub-quota of each side.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Instant;

use crate::db::{AccountRepo, Database, DbError, OrderRepo, PendingOrderRepo};
use crate::engine::OrderEngine;
use crate::exchange::ExchangeLimits;
use crate::models::{sort_price, Id, Order, PendingOrder, Side};

// ============================================================================
// Pure selection core
// ============================================================================

/// One ranked entry: either live at the exchange or queued locally.
#[derive(Debug, Clone)]
pub enum QueueItem {
    Active(Order),
    Pending(PendingOrder),
}

impl QueueItem {
    pub fn side(&self) -> Side {
        match self {
            QueueItem::Active(o) => o.side,
            QueueItem::Pending(p) => p.side,
        }
    }

    pub fn is_stop(&self) -> bool {
        match self {
            QueueItem::Active(o) => o.order_type.is_stop(),
            QueueItem::Pending(p) => p.order_type.is_stop(),
        }
    }

    /// Active orders carry no stored priority; they rank at the default
    /// (highest) class so a live order is never churned for an equal
    /// pending one. Mid-flight rows (PENDING/CANCELLING) rank above
    /// everything: they hold an exchange slot whether we like it or not,
    /// so the planner must account for them before handing out slots.
    pub fn priority(&self) -> i32 {
        match self {
            QueueItem::Active(o) if !o.status.is_ui_open() => i32::MIN,
            QueueItem::Active(_) => 0,
            QueueItem::Pending(p) => p.priority,
        }
    }

    pub fn sort_price(&self) -> Decimal {
        match self {
            QueueItem::Active(o) => sort_price(o.side, o.order_type, o.price, o.stop_price),
            QueueItem::Pending(p) => p.sort_price,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            QueueItem::Active(o) => o.created_at,
            QueueItem::Pending(p) => p.created_at,
        }
    }

    /// Only orders actually resting at the exchange can be demoted;
    /// PENDING and CANCELLING rows are mid-flight and untouchable.
    fn demotable(&self) -> bool {
        match self {
            QueueItem::Active(o) => o.status.is_ui_open(),
            QueueItem::Pending(_) => false,
        }
    }
}

/// Actions for one side of one key.
#[derive(Debug, Default)]
pub struct SidePlan {
    pub demote: Vec<Order>,
    pub promote: Vec<PendingOrder>,
}

impl SidePlan {
    pub fn is_noop(&self) -> bool {
        self.demote.is_empty() && self.promote.is_empty()
    }
}

/// Greedy top-N selection honoring the STOP sub-quota.
///
/// Idempotent on stable inputs: when the chosen set equals the live set
/// the plan is empty.
pub fn plan_side(mut items: Vec<QueueItem>, max_per_side: usize, max_stop: usize) -> SidePlan {
    items.sort_by(|a, b| {
        a.priority()
            .cmp(&b.priority())
            .then(b.sort_price().cmp(&a.sort_price()))
            .then(a.created_at().cmp(&b.created_at()))
    });

    let mut taken = 0usize;
    let mut stop_taken = 0usize;
    let mut plan = SidePlan::default();

    for item in items {
        let fits = taken < max_per_side && (!item.is_stop() || stop_taken < max_stop);
        if fits {
            taken += 1;
            if item.is_stop() {
                stop_taken += 1;
            }
            if let QueueItem::Pending(p) = item {
                plan.promote.push(p);
            }
        } else {
            match item {
                QueueItem::Active(o) if o.status.is_ui_open() => plan.demote.push(o),
                // Mid-flight rows and queued rows simply stay put.
                _ => {}
            }
        }
    }
    plan
}

// ============================================================================
// The scheduler
// ============================================================================

pub struct QueueScheduler {
    db: Database,
    engine: Arc<OrderEngine>,
    /// Per-(account, symbol) rebalance mutex, created on first touch and
    /// reaped when idle.
    locks: DashMap<(Id, String), Arc<tokio::sync::Mutex<()>>>,
    stop_ratio: f64,
}

impl QueueScheduler {
    pub fn new(db: Database, engine: Arc<OrderEngine>, stop_ratio: f64) -> Self {
        Self {
            db,
            engine,
            locks: DashMap::new(),
            stop_ratio,
        }
    }

    /// One tick over every touched key.
    pub async fn run_cycle(&self) {
        let keys = match self.touched_keys().await {
            Ok(k) => k,
            Err(e) => {
                tracing::error!(error = %e, "Queue cycle key scan failed");
                return;
            }
        };

        for (account_id, symbol) in keys {
            if let Err(e) = self.rebalance_key(account_id, &symbol).await {
                tracing::warn!(account_id, %symbol, error = %e, "Rebalance failed");
            }
        }
    }

    async fn touched_keys(&self) -> Result<Vec<(Id, String)>, DbError> {
        let mut keys = OrderRepo::active_keys(&self.db).await?;
        keys.extend(PendingOrderRepo::keys(&self.db).await?);
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    /// Rebalance one (account, symbol) key under its mutex.
    pub async fn rebalance_key(&self, account_id: Id, symbol: &str) -> Result<(), DbError> {
        let lock = self
            .locks
            .entry((account_id, symbol.to_string()))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;
        let started = Instant::now();

        let Some(account) = AccountRepo::find_by_id(&self.db, account_id).await? else {
            return Ok(());
        };
        let limits = ExchangeLimits::for_market(account.exchange, account.market_type);
        let max_stop = limits.max_stop_per_side(self.stop_ratio);

        let active = OrderRepo::active_for_key(&self.db, account_id, symbol).await?;
        let pending = PendingOrderRepo::ranked_for_key(&self.db, account_id, symbol).await?;

        let mut buys: Vec<QueueItem> = Vec::new();
        let mut sells: Vec<QueueItem> = Vec::new();
        for order in active {
            match order.side {
                Side::Buy => buys.push(QueueItem::Active(order)),
                Side::Sell => sells.push(QueueItem::Active(order)),
            }
        }
        for p in pending {
            match p.side {
                Side::Buy => buys.push(QueueItem::Pending(p)),
                Side::Sell => sells.push(QueueItem::Pending(p)),
            }
        }

        let buy_plan = plan_side(buys, limits.max_per_side, max_stop);
        let sell_plan = plan_side(sells, limits.max_per_side, max_stop);
        if buy_plan.is_noop() && sell_plan.is_noop() {
            return Ok(());
        }

        let mut cancelled_n = 0usize;
        let mut promoted_n = 0usize;
        for plan in [buy_plan, sell_plan] {
            for order in plan.demote {
                if self.demote(&account, &order).await {
                    cancelled_n += 1;
                }
            }
            for pending in plan.promote {
                if self.promote(&account, &pending).await {
                    promoted_n += 1;
                }
            }
        }

        tracing::info!(
            account_id,
            symbol,
            cancelled_n,
            promoted_n,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Rebalance cycle"
        );
        Ok(())
    }

    /// Cancel at the exchange, then requeue locally with the placement
    /// fields preserved. A failed cancel leaves everything as-is for the
    /// next tick.
    async fn demote(&self, account: &crate::models::Account, order: &Order) -> bool {
        if let Err(e) = self.engine.cancel_order(account, order).await {
            tracing::warn!(order_id = order.order_id, error = %e, "Demotion cancel failed");
            return false;
        }

        let params = crate::models::PlacementParams {
            strategy_account_id: order.strategy_account_id,
            symbol: order.symbol.clone(),
            side: order.side,
            order_type: order.order_type,
            quantity: order.remaining_quantity(),
            price: order.price,
            stop_price: order.stop_price,
            market_type: order.market_type,
        };
        match PendingOrderRepo::insert(&self.db, account.account_id, &params, 0).await {
            Ok(_) => {
                if let Err(e) = OrderRepo::delete(&self.db, order.order_id).await {
                    tracing::warn!(order_id = order.order_id, error = %e, "Demoted row cleanup failed");
                }
                true
            }
            Err(e) => {
                tracing::error!(order_id = order.order_id, error = %e, "Requeue after cancel failed");
                false
            }
        }
    }

    /// DB-first create; the queue row is deleted only on success, so a
    /// failed promotion retries on the next tick.
    async fn promote(&self, account: &crate::models::Account, pending: &PendingOrder) -> bool {
        match self
            .engine
            .create_order(account, pending.placement())
            .await
        {
            Ok(_) => {
                if let Err(e) =
                    PendingOrderRepo::delete(&self.db, pending.pending_order_id).await
                {
                    tracing::warn!(
                        pending_order_id = pending.pending_order_id,
                        error = %e,
                        "Promoted queue row cleanup failed"
                    );
                }
                true
            }
            Err(e) => {
                tracing::warn!(
                    pending_order_id = pending.pending_order_id,
                    error = %e,
                    "Promotion failed; row stays queued"
                );
                false
            }
        }
    }

    /// Drop per-key mutexes nobody is holding (60s reaper).
    pub fn reap_locks(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MarketType, OrderStatus, OrderType};
    use rust_decimal::prelude::FromPrimitive;

    fn dec(v: f64) -> Decimal {
        Decimal::from_f64(v).unwrap()
    }

    fn active_limit(id: Id, price: f64, minutes_ago: i64) -> QueueItem {
        QueueItem::Active(Order {
            order_id: id,
            strategy_account_id: 1,
            symbol: "BTC/USDT".to_string(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            quantity: dec(0.01),
            filled_quantity: Decimal::ZERO,
            price: Some(dec(price)),
            stop_price: None,
            market_type: MarketType::Spot,
            status: OrderStatus::Open,
            exchange_order_id: format!("ex-{}", id),
            error_message: None,
            cancel_attempted_at: None,
            created_at: Utc::now() - chrono::Duration::minutes(minutes_ago),
            updated_at: Utc::now(),
        })
    }

    fn pending_limit(id: Id, price: f64) -> QueueItem {
        pending_limit_side(id, price, Side::Buy, OrderType::Limit, None)
    }

    fn pending_limit_side(
        id: Id,
        price: f64,
        side: Side,
        order_type: OrderType,
        stop: Option<f64>,
    ) -> QueueItem {
        let price = Some(dec(price));
        let stop_price = stop.map(dec);
        QueueItem::Pending(PendingOrder {
            pending_order_id: id,
            strategy_account_id: 1,
            account_id: 1,
            symbol: "BTC/USDT".to_string(),
            side,
            order_type,
            quantity: dec(0.01),
            price,
            stop_price,
            market_type: MarketType::Spot,
            priority: 0,
            sort_price: sort_price(side, order_type, price, stop_price),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
    }

    #[test]
    fn test_stable_state_is_fixed_point() {
        // 20 open orders at cap 20: nothing to do.
        let items: Vec<QueueItem> = (0..20)
            .map(|i| active_limit(i, 100.0 - i as f64, 10))
            .collect();
        let plan = plan_side(items, 20, 5);
        assert!(plan.is_noop());
    }

    #[test]
    fn test_queue_eviction_scenario() {
        // Cap 20; 20 active at 100..81 plus a new pending at 95: the
        // pending beats the bottom active (81), which gets demoted.
        let mut items: Vec<QueueItem> = (0..20)
            .map(|i| active_limit(i, 100.0 - i as f64, 10))
            .collect();
        items.push(pending_limit(1000, 95.0));

        let plan = plan_side(items, 20, 5);
        assert_eq!(plan.promote.len(), 1);
        assert_eq!(plan.promote[0].pending_order_id, 1000);
        assert_eq!(plan.demote.len(), 1);
        assert_eq!(plan.demote[0].price, Some(dec(81.0)));
    }

    #[test]
    fn test_worse_pending_stays_queued() {
        let mut items: Vec<QueueItem> = (0..20)
            .map(|i| active_limit(i, 100.0 - i as f64, 10))
            .collect();
        items.push(pending_limit(1000, 50.0));

        let plan = plan_side(items, 20, 5);
        assert!(plan.is_noop());
    }

    #[test]
    fn test_stop_sub_quota() {
        // Cap 4 with stop quota 1: only one stop fits even with slots free.
        let items = vec![
            pending_limit_side(1, 0.0, Side::Sell, OrderType::StopMarket, Some(96.0)),
            pending_limit_side(2, 0.0, Side::Sell, OrderType::StopMarket, Some(95.0)),
            pending_limit_side(3, 99.0, Side::Sell, OrderType::Limit, None),
        ];
        let plan = plan_side(items, 4, 1);
        let promoted: Vec<Id> = plan.promote.iter().map(|p| p.pending_order_id).collect();
        // SELL STOP ranks higher trigger first: stop at 96 wins the quota.
        assert!(promoted.contains(&1));
        assert!(!promoted.contains(&2));
        assert!(promoted.contains(&3));
    }

    #[test]
    fn test_sell_side_ranks_lowest_ask_first() {
        let items = vec![
            pending_limit_side(1, 101.0, Side::Sell, OrderType::Limit, None),
            pending_limit_side(2, 99.0, Side::Sell, OrderType::Limit, None),
        ];
        let plan = plan_side(items, 1, 1);
        assert_eq!(plan.promote.len(), 1);
        assert_eq!(plan.promote[0].pending_order_id, 2);
    }

    #[test]
    fn test_tie_broken_by_age() {
        let older = active_limit(1, 90.0, 30);
        let newer = active_limit(2, 90.0, 1);
        let plan = plan_side(vec![newer, older], 1, 1);
        assert_eq!(plan.demote.len(), 1);
        // The newer order loses the tie.
        assert_eq!(plan.demote[0].order_id, 2);
    }

    #[test]
    fn test_mid_flight_rows_never_demoted() {
        let mut cancelling = match active_limit(1, 100.0, 10) {
            QueueItem::Active(o) => o,
            _ => unreachable!(),
        };
        cancelling.status = OrderStatus::Cancelling;
        let items = vec![
            QueueItem::Active(cancelling),
            pending_limit(2, 200.0),
        ];
        // Cap 1: the cancelling row holds the slot; nothing is demoted
        // and the pending row waits.
        let plan = plan_side(items, 1, 1);
        assert!(plan.demote.is_empty());
        assert!(plan.promote.is_empty());
    }
}
