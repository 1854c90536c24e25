//! DB-first order create/cancel engine
//!
//! The invariant everything here serves: every exchange-side order has a
//! database row predating the exchange call. Create inserts PENDING and
//! commits before the adapter is touched; cancel moves to CANCELLING and
//! commits before the cancel request leaves the process. A kill -9 at
//! any point leaves a tracked row for the sweeper or reconciler.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::db::{Database, DbError, FailedOrderRepo, OrderRepo, PendingOrderRepo};
use crate::events::{order_event_data, EventBus, EventType, OrderEventKind};
use crate::exchange::{AdapterRegistry, ExchangeError, PlaceOrderRequest};
use crate::models::{Account, Id, Order, OrderStatus, PlacementParams};
use crate::sanitize::{sanitize_error, truncate_reason};

/// Transient exchange errors retry with these delays; everything else is
/// final on the first response.
const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid order parameters: {0}")]
    InvalidParams(String),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error("Exchange rejected order {order_id}: {message}")]
    Rejected { order_id: Id, message: String },

    #[error("Cancel failed for order {order_id}: {message}")]
    CancelFailed { order_id: Id, message: String },

    #[error("Order {0} is not in a cancellable state")]
    NotCancellable(Id),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}

/// Outcome of a bulk cancel pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct CancelOutcome {
    pub cancelled: usize,
    pub failed: usize,
    pub pending_dropped: u64,
}

pub struct OrderEngine {
    db: Database,
    registry: Arc<AdapterRegistry>,
    bus: Arc<EventBus>,
}

impl OrderEngine {
    pub fn new(db: Database, registry: Arc<AdapterRegistry>, bus: Arc<EventBus>) -> Self {
        Self { db, registry, bus }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Place an order DB-first.
    ///
    /// 1. Insert the PENDING row (with its `PENDING-<uuid>` marker) and
    ///    commit.
    /// 2. Call the exchange, retrying transient failures.
    /// 3. CAS to OPEN with the real exchange id, or to FAILED with the
    ///    sanitized error plus a FailedOrder row.
    pub async fn create_order(
        &self,
        account: &Account,
        params: PlacementParams,
    ) -> Result<Order, EngineError> {
        params
            .validate_shape()
            .map_err(EngineError::InvalidParams)?;

        let order = OrderRepo::insert_pending(&self.db, &params).await?;
        tracing::info!(
            order_id = order.order_id,
            symbol = %order.symbol,
            side = %order.side,
            order_type = %order.order_type,
            "Order row created (PENDING)"
        );

        let adapter = self.registry.adapter_for(account)?;
        let request = PlaceOrderRequest {
            symbol: params.symbol.clone(),
            side: params.side,
            order_type: params.order_type,
            quantity: params.quantity,
            price: params.price,
            stop_price: params.stop_price,
            market_type: params.market_type,
        };

        match with_retry(|| adapter.create_order(&request)).await {
            Ok(ack) => {
                let moved =
                    OrderRepo::mark_open(&self.db, order.order_id, &ack.exchange_order_id).await?;
                if !moved {
                    // The sweeper got there first (request outlived the
                    // webhook deadline); the row is already FAILED, but
                    // the exchange order is live - the reconciler will
                    // re-adopt it by exchange_order_id.
                    tracing::warn!(
                        order_id = order.order_id,
                        "PENDING row resolved elsewhere before acknowledgement"
                    );
                }
                let order = OrderRepo::find_by_id(&self.db, order.order_id)
                    .await?
                    .unwrap_or(Order {
                        status: OrderStatus::Open,
                        exchange_order_id: ack.exchange_order_id.clone(),
                        ..order
                    });

                self.emit_order_event(OrderEventKind::Created, &order).await;
                Ok(order)
            }
            Err(e) => {
                let sanitized = sanitize_error(&e.to_string());
                OrderRepo::mark_failed(&self.db, order.order_id, &sanitized).await?;
                FailedOrderRepo::insert(
                    &self.db,
                    &params,
                    &truncate_reason(error_reason(&e)),
                    Some(&sanitized),
                )
                .await?;
                tracing::warn!(
                    order_id = order.order_id,
                    error = %sanitized,
                    "Order placement failed"
                );
                Err(EngineError::Rejected {
                    order_id: order.order_id,
                    message: sanitized,
                })
            }
        }
    }

    /// Cancel an order DB-first: CANCELLING is committed before the
    /// exchange sees the cancel; failure restores OPEN.
    pub async fn cancel_order(
        &self,
        account: &Account,
        order: &Order,
    ) -> Result<(), EngineError> {
        let moved = OrderRepo::mark_cancelling(&self.db, order.order_id).await?;
        if !moved {
            return Err(EngineError::NotCancellable(order.order_id));
        }

        let adapter = self.registry.adapter_for(account)?;
        match with_retry(|| adapter.cancel_order(&order.symbol, &order.exchange_order_id)).await {
            Ok(()) => {
                OrderRepo::mark_cancelled(&self.db, order.order_id).await?;
                let mut cancelled = order.clone();
                cancelled.status = OrderStatus::Cancelled;
                self.emit_order_event(OrderEventKind::Cancelled, &cancelled)
                    .await;
                Ok(())
            }
            Err(e) => {
                let sanitized = sanitize_error(&e.to_string());
                OrderRepo::restore_open(&self.db, order.order_id, &sanitized).await?;
                tracing::warn!(
                    order_id = order.order_id,
                    error = %sanitized,
                    "Cancel failed; order restored to OPEN"
                );
                Err(EngineError::CancelFailed {
                    order_id: order.order_id,
                    message: sanitized,
                })
            }
        }
    }

    /// Cancel every active order of a subscription (optionally one
    /// symbol), dropping queued rows too. Per-order failures are counted,
    /// never fatal.
    pub async fn cancel_all(
        &self,
        account: &Account,
        strategy_account_id: Id,
        symbol: Option<&str>,
    ) -> Result<CancelOutcome, EngineError> {
        let mut outcome = CancelOutcome {
            pending_dropped: PendingOrderRepo::delete_for_key(&self.db, strategy_account_id, symbol)
                .await?,
            ..Default::default()
        };

        let orders =
            OrderRepo::active_for_strategy_account(&self.db, strategy_account_id, symbol).await?;
        for order in &orders {
            if order.status == OrderStatus::Pending {
                // Not at the exchange yet; the sweeper owns PENDING rows.
                continue;
            }
            match self.cancel_order(account, order).await {
                Ok(()) => outcome.cancelled += 1,
                Err(e) => {
                    outcome.failed += 1;
                    tracing::warn!(order_id = order.order_id, error = %e, "Bulk cancel failure");
                }
            }
        }
        Ok(outcome)
    }

    /// Retry a failed order through the normal DB-first path.
    pub async fn retry_failed(
        &self,
        account: &Account,
        failed_order_id: Id,
        max_retry: u32,
    ) -> Result<Order, EngineError> {
        let failed = FailedOrderRepo::find_by_id(&self.db, failed_order_id)
            .await?
            .ok_or_else(|| EngineError::InvalidParams("failed order not found".to_string()))?;

        let claimed = FailedOrderRepo::claim_retry(&self.db, failed_order_id, max_retry).await?;
        if !claimed {
            return Err(EngineError::InvalidParams(format!(
                "retry budget exhausted (max {})",
                max_retry
            )));
        }

        let params: PlacementParams = serde_json::from_value(failed.params_json.clone())
            .map_err(|e| EngineError::InvalidParams(format!("stored params unreadable: {}", e)))?;

        let order = self.create_order(account, params).await?;
        FailedOrderRepo::mark_removed(&self.db, failed_order_id).await?;
        Ok(order)
    }

    pub(crate) async fn emit_order_event(&self, kind: OrderEventKind, order: &Order) {
        match OrderRepo::context_for(&self.db, order.strategy_account_id).await {
            Ok(Some(ctx)) => {
                self.bus
                    .emit(
                        ctx.strategy_id,
                        EventType::OrderUpdate,
                        order_event_data(kind, order, &ctx),
                    )
                    .await;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(order_id = order.order_id, error = %e, "Event context lookup failed");
            }
        }
    }
}

/// Short FailedOrder.reason classification per error kind.
fn error_reason(e: &ExchangeError) -> &'static str {
    match e {
        ExchangeError::Network(_) => "network error",
        ExchangeError::Auth(_) => "authentication failed",
        ExchangeError::InsufficientFunds(_) => "insufficient funds",
        ExchangeError::InvalidOrder(_) => "invalid order",
        ExchangeError::RateLimit(_) => "rate limited",
        ExchangeError::Exchange(_) => "exchange rejection",
    }
}

/// Retry transient exchange errors with the fixed backoff ladder;
/// non-transient errors and the final attempt return immediately.
pub async fn with_retry<F, Fut, T>(op: F) -> Result<T, ExchangeError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, ExchangeError>>,
{
    let mut last_err = None;
    for (attempt, delay) in std::iter::once(None)
        .chain(RETRY_DELAYS.iter().map(Some))
        .enumerate()
    {
        if let Some(delay) = delay {
            tokio::time::sleep(*delay).await;
        }
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() => {
                tracing::debug!(attempt, error = %e, "Transient exchange error");
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| ExchangeError::Exchange("retry exhausted".to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_on_fatal_error() {
        let attempts = AtomicUsize::new(0);
        let result: Result<(), _> = with_retry(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(ExchangeError::InvalidOrder("bad".to_string())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausts_transient() {
        let attempts = AtomicUsize::new(0);
        let result: Result<(), _> = with_retry(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(ExchangeError::Network("timeout".to_string())) }
        })
        .await;
        assert!(result.is_err());
        // Initial attempt plus the 1s/2s/4s ladder.
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers() {
        let attempts = AtomicUsize::new(0);
        let result = with_retry(|| {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ExchangeError::RateLimit("slow down".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_error_reason_classification() {
        assert_eq!(
            error_reason(&ExchangeError::InsufficientFunds("x".into())),
            "insufficient funds"
        );
        assert_eq!(
            error_reason(&ExchangeError::InvalidOrder("x".into())),
            "invalid order"
        );
    }
}
