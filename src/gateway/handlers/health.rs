//! Health endpoints
//!
//! `/health` reports overall status with a rate-limited DB ping;
//! `/health/ready` gates deployment rollouts (503 while the database is
//! unreachable); `/health/live` only proves the process is serving.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use super::super::state::AppState;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Ping the DB at most once per interval; health checks arrive from
/// several probes at once and must not amplify into DB load.
async fn database_up(state: &AppState) -> bool {
    static LAST_CHECK_MS: AtomicU64 = AtomicU64::new(0);
    static LAST_RESULT: AtomicU64 = AtomicU64::new(1);
    const CHECK_INTERVAL_MS: u64 = 5000;

    let now = now_ms();
    let last = LAST_CHECK_MS.load(Ordering::Relaxed);
    if now.saturating_sub(last) > CHECK_INTERVAL_MS {
        LAST_CHECK_MS.store(now, Ordering::Relaxed);
        let up = state.db.health_check().await.is_ok();
        LAST_RESULT.store(u64::from(up), Ordering::Relaxed);
        if !up {
            tracing::error!("[HEALTH] database ping failed");
        }
        up
    } else {
        LAST_RESULT.load(Ordering::Relaxed) == 1
    }
}

pub async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    let db_up = database_up(&state).await;
    let status = if db_up { "ok" } else { "degraded" };
    (
        StatusCode::OK,
        Json(json!({
            "status": status,
            "timestamp": now_ms(),
            "database": if db_up { "up" } else { "down" },
        })),
    )
}

pub async fn ready(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    if database_up(&state).await {
        (
            StatusCode::OK,
            Json(json!({"status": "ready", "timestamp": now_ms()})),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "unavailable", "timestamp": now_ms()})),
        )
    }
}

pub async fn live() -> (StatusCode, Json<Value>) {
    (
        StatusCode::OK,
        Json(json!({"status": "alive", "timestamp": now_ms()})),
    )
}
