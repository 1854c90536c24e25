//! POST /webhook
//!
//! The one write entry point for signal sources. Contract: always HTTP
//! 200 with a success flag - TradingView-style sources treat any 5xx as
//! a retry trigger, and a retried order is worse than a dropped one. The
//! handler runs the fan-out under the wall-clock deadline; on expiry the
//! work keeps running detached (rows are already PENDING, so the sweeper
//! and reconciler finish the job).

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use std::sync::Arc;
use std::time::Instant;

use super::super::state::AppState;
use super::super::types::{PerformanceMetrics, WebhookResponse};
use crate::router::{IntentAction, RouterError, WebhookPayload};

pub async fn handle_webhook(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<WebhookPayload>, JsonRejection>,
) -> Json<WebhookResponse> {
    let started = Instant::now();
    let deadline = state.config.http_deadline;

    let Json(payload) = match payload {
        Ok(p) => p,
        Err(e) => {
            return Json(WebhookResponse::rejected(format!("malformed body: {}", e)));
        }
    };

    // Route + execute on a detached task so deadline expiry abandons the
    // wait, not the work.
    let work_state = state.clone();
    let work = tokio::spawn(async move {
        let routed = match work_state.router.route(&payload).await {
            Ok(r) => r,
            Err(e) => return Err(e),
        };
        let action = describe_action(&routed);
        let strategy = routed.strategy.group_name.clone();
        let outcome = work_state.orchestrator.execute(&routed).await;
        Ok((action, strategy, outcome))
    });

    match tokio::time::timeout(deadline, work).await {
        Ok(Ok(Ok((action, strategy, outcome)))) => {
            let metrics = PerformanceMetrics {
                elapsed_ms: started.elapsed().as_millis() as u64,
                deadline_ms: deadline.as_millis() as u64,
                timed_out: false,
            };
            Json(WebhookResponse::ok(action, strategy, outcome, metrics))
        }
        Ok(Ok(Err(router_error))) => {
            tracing::info!(error = %router_error, "Webhook rejected");
            Json(WebhookResponse::rejected(public_error(&router_error)))
        }
        Ok(Err(join_error)) => {
            // Task panicked: a genuine implementation fault. Still shaped
            // as a body; the axum layer would 500 on a handler panic, not
            // here.
            tracing::error!(error = %join_error, "Webhook task failed");
            Json(WebhookResponse::rejected("internal error".to_string()))
        }
        Err(_) => {
            tracing::warn!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Webhook deadline expired; work continues detached"
            );
            Json(WebhookResponse::timed_out(PerformanceMetrics {
                elapsed_ms: started.elapsed().as_millis() as u64,
                deadline_ms: deadline.as_millis() as u64,
                timed_out: true,
            }))
        }
    }
}

fn describe_action(routed: &crate::router::RoutedSignal) -> String {
    if routed.is_batch {
        return format!("batch({})", routed.intent_count());
    }
    routed
        .high
        .first()
        .or_else(|| routed.low.first())
        .map(|intent| match intent.action {
            IntentAction::Place(t) => t.as_str().to_string(),
            IntentAction::Cancel => "CANCEL".to_string(),
            IntentAction::CancelAll => "CANCEL_ALL_ORDER".to_string(),
        })
        .unwrap_or_else(|| "unknown".to_string())
}

/// Error text shown to the signal source. Auth failures stay vague.
fn public_error(e: &RouterError) -> String {
    match e {
        RouterError::AuthFailed => "authentication failed".to_string(),
        RouterError::Db(inner) => {
            tracing::error!(error = %inner, "Webhook DB failure");
            "internal error".to_string()
        }
        other => other.to_string(),
    }
}
