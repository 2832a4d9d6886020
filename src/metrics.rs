//! Prometheus metrics: recorder setup, name helpers, and the `/metrics`
//! endpoint.

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::get;
use axum::Router;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use tokio_util::sync::CancellationToken;

/// Install the global Prometheus recorder and return the render handle.
///
/// Panics if a recorder is already installed (call once, from `main`).
pub fn setup_metrics_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("http_push_latency_seconds".to_string()),
            &[0.05, 0.1, 0.2, 0.5, 1.0, 2.0, 5.0],
        )
        .expect("invalid histogram buckets")
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

async fn metrics_handler(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}

pub fn metrics_router(handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(handle)
}

/// Serve `GET /metrics` until cancelled.
pub async fn serve_on(
    listener: tokio::net::TcpListener,
    handle: PrometheusHandle,
    cancel: CancellationToken,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("metrics listening on http://{addr}/metrics");
    }
    axum::serve(listener, metrics_router(handle))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .context("metrics server")?;
    Ok(())
}

// ── Client front ───────────────────────────────────────────────────

pub fn record_client_connect() {
    counter!("ws_connects_total").increment(1);
}

pub fn record_client_error() {
    counter!("ws_errors_total").increment(1);
}

pub fn record_dropped_frames(n: u64) {
    counter!("ws_dropped_frames_total").increment(n);
}

// ── Multiplexer ────────────────────────────────────────────────────

pub fn set_active_subscriptions(count: usize) {
    gauge!("active_subscriptions").set(count as f64);
}

pub fn record_full_reconnect() {
    counter!("full_reconnects_total").increment(1);
}

// ── Health monitor ─────────────────────────────────────────────────

pub fn set_stale_subscriptions(count: usize) {
    gauge!("stale_subscriptions").set(count as f64);
}

pub fn set_last_data_age(symbol: &str, timeframe: &str, seconds: f64) {
    gauge!(
        "last_data_received_seconds",
        "symbol" => symbol.to_string(),
        "timeframe" => timeframe.to_string()
    )
    .set(seconds);
}

pub fn record_recovery_attempt() {
    counter!("recovery_attempts_total").increment(1);
}

pub fn record_recovery_success() {
    counter!("successful_recoveries_total").increment(1);
}

pub fn record_recovery_failure() {
    counter!("failed_recoveries_total").increment(1);
}

// ── Push sink ──────────────────────────────────────────────────────

pub fn record_bar_pushed() {
    counter!("bars_pushed_total").increment(1);
}

pub fn record_push_latency(seconds: f64) {
    histogram!("http_push_latency_seconds").record(seconds);
}
