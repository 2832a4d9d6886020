//! Health HTTP API: liveness, detailed status, and operator-triggered
//! recovery.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::error::ApiError;
use crate::state::AppState;
use crate::types::SubscriptionKey;

pub fn api_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/recovery/subscription", post(recover_subscription))
        .route("/recovery/full-reconnect", post(recover_full))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve_on(
    listener: tokio::net::TcpListener,
    state: Arc<AppState>,
    cancel: CancellationToken,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("health api listening on http://{addr}");
    }
    axum::serve(listener, api_router(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .context("health api server")?;
    Ok(())
}

/// 200 while the upstream session is connected, 503 otherwise.
async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    let connected = state.mux.is_connected();
    let body = json!({
        "status": if connected { "ok" } else { "degraded" },
        "uptime": state.uptime_secs(),
        "tradingview": {
            "connected": connected,
            "subscriptions": state.mux.subscription_count().await,
        },
        "health_monitor": {
            "active": state.health.is_active(),
            "stale_subscriptions": state.health.stale_count().await,
        },
    });
    let code = if connected {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body))
}

async fn status(State(state): State<Arc<AppState>>) -> Json<Value> {
    let cfg = state.health.config();
    let subscriptions: Vec<Value> = state
        .mux
        .snapshot()
        .await
        .into_iter()
        .map(|(key, last_bar_time)| {
            json!({
                "symbol": key.symbol,
                "timeframe": key.timeframe,
                "last_bar_time": if last_bar_time > 0 { Value::from(last_bar_time) } else { Value::Null },
            })
        })
        .collect();

    Json(json!({
        "status": if state.mux.is_connected() { "ok" } else { "degraded" },
        "uptime": state.uptime_secs(),
        "tradingview": {
            "connected": state.mux.is_connected(),
            "subscriptions": subscriptions,
        },
        "health_monitor": {
            "active": state.health.is_active(),
            "stale_subscriptions": state.health.stale_count().await,
            "config": {
                "check_interval_ms": cfg.check_interval.as_millis() as u64,
                "stale_threshold_multiplier": cfg.stale_threshold_multiplier,
                "auto_recovery_enabled": cfg.auto_recovery_enabled,
                "max_recovery_attempts": cfg.max_recovery_attempts,
                "full_reconnect_threshold": cfg.full_reconnect_threshold,
                "full_reconnect_cooldown_ms": cfg.full_reconnect_cooldown.as_millis() as u64,
            },
        },
    }))
}

#[derive(Debug, Deserialize)]
struct RecoveryRequest {
    #[serde(default)]
    symbol: String,
    #[serde(default)]
    timeframe: String,
}

/// Trigger the same unsubscribe → settle → resubscribe sequence the monitor
/// uses for a stale key.
async fn recover_subscription(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RecoveryRequest>,
) -> Result<Json<Value>, ApiError> {
    if req.symbol.trim().is_empty() || req.timeframe.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "symbol and timeframe required".to_string(),
        ));
    }
    let key = SubscriptionKey::new(&req.symbol, &req.timeframe);
    if !state.mux.list().await.contains(&key) {
        return Err(ApiError::NotFound(format!("no subscription for {key}")));
    }
    let success = state.health.recover_subscription(&key).await;
    Ok(Json(json!({
        "success": success,
        "symbol": key.symbol,
        "timeframe": key.timeframe,
    })))
}

async fn recover_full(State(state): State<Arc<AppState>>) -> Json<Value> {
    let success = state.mux.full_reconnect().await;
    Json(json!({ "success": success }))
}
