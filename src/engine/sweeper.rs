//! Orphan and stale-cancel recovery
//!
//! The safety net behind the DB-first flows: rows abandoned between the
//! local commit and the exchange acknowledgement (crash, webhook
//! deadline, lost response) are resolved here. Runs inside the ~29s
//! reconciliation cycle.

use std::sync::Arc;
use std::time::Duration;

use crate::db::{AccountRepo, Database, DbError, OrderRepo};
use crate::exchange::AdapterRegistry;
use crate::models::{Order, OrderStatus};

pub struct Sweeper {
    db: Database,
    registry: Arc<AdapterRegistry>,
    /// Age after which PENDING / CANCELLING counts as abandoned.
    stuck_threshold: Duration,
}

/// Counts for the cycle's consolidated log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct SweepOutcome {
    pub orphaned_pending: usize,
    pub resolved_cancelling: usize,
    pub restored_open: usize,
}

impl Sweeper {
    pub fn new(db: Database, registry: Arc<AdapterRegistry>, stuck_threshold: Duration) -> Self {
        Self {
            db,
            registry,
            stuck_threshold,
        }
    }

    pub async fn run_once(&self) -> Result<SweepOutcome, DbError> {
        let mut outcome = SweepOutcome::default();
        self.sweep_pending(&mut outcome).await?;
        self.sweep_cancelling(&mut outcome).await?;

        if outcome.orphaned_pending > 0
            || outcome.resolved_cancelling > 0
            || outcome.restored_open > 0
        {
            tracing::info!(
                orphaned_pending = outcome.orphaned_pending,
                resolved_cancelling = outcome.resolved_cancelling,
                restored_open = outcome.restored_open,
                "Sweep cycle resolved stuck orders"
            );
        }
        Ok(outcome)
    }

    /// PENDING rows older than the threshold were abandoned between the
    /// insert and the exchange ack; fail them so capital is not silently
    /// reserved forever. If the exchange call did land, the poll diff
    /// re-adopts the live order by its exchange id.
    async fn sweep_pending(&self, outcome: &mut SweepOutcome) -> Result<(), DbError> {
        let stuck = OrderRepo::stuck_pending(&self.db, self.stuck_threshold).await?;
        for order in &stuck {
            let moved = OrderRepo::mark_terminal(
                &self.db,
                order.order_id,
                OrderStatus::Failed,
                Some("stuck in PENDING > 120s"),
            )
            .await?;
            if moved {
                outcome.orphaned_pending += 1;
                tracing::warn!(
                    order_id = order.order_id,
                    symbol = %order.symbol,
                    "PENDING orphan failed by sweeper"
                );
            }
        }
        Ok(())
    }

    /// CANCELLING rows older than the threshold: re-query the exchange
    /// once; if the order is gone (or the query shows it cancelled),
    /// promote to CANCELLED, otherwise retry the cancel once and resolve
    /// to CANCELLED or back to OPEN on the answer.
    async fn sweep_cancelling(&self, outcome: &mut SweepOutcome) -> Result<(), DbError> {
        let stale = OrderRepo::stale_cancelling(&self.db, self.stuck_threshold).await?;
        for order in &stale {
            match self.resolve_cancelling(order).await {
                Ok(true) => outcome.resolved_cancelling += 1,
                Ok(false) => outcome.restored_open += 1,
                Err(e) => {
                    tracing::warn!(order_id = order.order_id, error = %e, "Cancel sweep failed");
                }
            }
        }
        Ok(())
    }

    /// Returns Ok(true) when the row ended CANCELLED, Ok(false) when it
    /// was restored to OPEN.
    async fn resolve_cancelling(&self, order: &Order) -> Result<bool, DbError> {
        let Some(ctx) = OrderRepo::context_for(&self.db, order.strategy_account_id).await? else {
            // Subscription is gone; the row will cascade away.
            return Ok(false);
        };
        let Some(account) = AccountRepo::find_by_id(&self.db, ctx.account_id).await? else {
            return Ok(false);
        };
        let adapter = match self.registry.adapter_for(&account) {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!(order_id = order.order_id, error = %e, "No adapter for sweep");
                return Ok(false);
            }
        };

        // One verification fetch.
        match adapter
            .fetch_order(&order.symbol, &order.exchange_order_id)
            .await
        {
            Ok(remote) if remote.status == OrderStatus::Cancelled || remote.status.is_terminal() => {
                OrderRepo::mark_cancelled(&self.db, order.order_id).await?;
                return Ok(true);
            }
            Ok(_) => {}
            Err(_) => {
                // Not found usually means the cancel landed.
                OrderRepo::mark_cancelled(&self.db, order.order_id).await?;
                return Ok(true);
            }
        }

        // Still live at the exchange: one retry of the original cancel.
        match adapter
            .cancel_order(&order.symbol, &order.exchange_order_id)
            .await
        {
            Ok(()) => {
                OrderRepo::mark_cancelled(&self.db, order.order_id).await?;
                Ok(true)
            }
            Err(e) => {
                OrderRepo::restore_open(
                    &self.db,
                    order.order_id,
                    &crate::sanitize::sanitize_error(&e.to_string()),
                )
                .await?;
                Ok(false)
            }
        }
    }
}
