//! HTTP gateway (axum)
//!
//! Route groups:
//! - `/webhook` - signal ingestion, token carried in the body
//! - `/events/stream`, `/strategies/...`, `/failed-orders` - bearer
//!   webhook-token auth via middleware
//! - `/health*` - unauthenticated probes

pub mod handlers;
pub mod state;
pub mod types;

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::{from_fn_with_state, Next},
    response::Response,
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::db::StrategyRepo;
use state::{AppState, AuthUser};
use types::ApiError;

/// Bearer-token middleware: the caller's webhook token identifies the
/// user. Session/password flows live outside this service.
async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let token = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::unauthorized("missing bearer token"))?;

    let user = StrategyRepo::find_user_by_token(&state.db, token)
        .await
        .map_err(ApiError::db_error)?
        .ok_or_else(|| ApiError::unauthorized("invalid token"))?;

    request.extensions_mut().insert(AuthUser {
        user_id: user.user_id,
    });
    Ok(next.run(request).await)
}

/// Build the complete router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let authed = Router::new()
        .route("/events/stream", get(handlers::events::event_stream))
        .route(
            "/strategies/{strategy_id}/subscribe/{account_id}/status",
            get(handlers::subscription::subscription_status),
        )
        .route(
            "/strategies/{strategy_id}/subscribe/{account_id}",
            delete(handlers::subscription::delete_subscription),
        )
        .route(
            "/failed-orders",
            get(handlers::failed_orders::list_failed_orders),
        )
        .route(
            "/failed-orders/{id}/retry",
            post(handlers::failed_orders::retry_failed_order),
        )
        .route(
            "/failed-orders/{id}",
            delete(handlers::failed_orders::remove_failed_order),
        )
        .layer(from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/webhook", post(handlers::webhook::handle_webhook))
        .route("/health", get(handlers::health::health))
        .route("/health/ready", get(handlers::health::ready))
        .route("/health/live", get(handlers::health::live))
        .merge(authed)
        .with_state(state)
}

/// Bind and serve until the process is asked to stop.
pub async fn run_server(
    state: Arc<AppState>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = state.config.bind_addr.clone();
    let app = build_router(state);

    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "Gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
