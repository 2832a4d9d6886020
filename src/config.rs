//! Broker configuration derived from environment variables.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::health::HealthConfig;
use crate::types::SubscriptionKey;

#[derive(Debug, Clone)]
pub struct Config {
    // ── Upstream driver ────────────────────────────────────────────
    /// Proxy URL passed to the upstream driver. Empty ⇒ direct connection.
    pub proxy: Option<String>,
    pub upstream_timeout: Duration,

    /// Keys subscribed at startup. These are config-pinned: they survive
    /// the last client disconnect.
    pub initial_subscriptions: Vec<SubscriptionKey>,

    // ── HTTP push sink ─────────────────────────────────────────────
    /// Empty endpoint disables the push sink.
    pub backend_endpoint: String,
    pub backend_api_key: String,
    /// Retries after the first attempt.
    pub backend_retry_attempts: u32,
    pub backend_retry_backoff: Duration,

    // ── Listeners ──────────────────────────────────────────────────
    pub websocket_port: u16,
    pub websocket_enabled: bool,
    pub health_api_port: u16,
    pub metrics_port: u16,

    // ── Logging ────────────────────────────────────────────────────
    pub log_level: String,
    pub log_file: Option<String>,
    pub debug_prices: bool,
    pub prices_log_file: String,

    pub health: HealthConfig,
}

fn env_str(name: &str, default: &str) -> String {
    env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_u16(name: &str, default: u16) -> u16 {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .map(|s| {
            matches!(
                s.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "y" | "on"
            )
        })
        .unwrap_or(default)
}

#[derive(Debug, Deserialize)]
struct SubscriptionSpec {
    symbol: String,
    timeframe: String,
}

/// Parse the `SUBSCRIPTIONS` JSON array into normalized keys.
///
/// Malformed JSON is a fatal startup error; an empty value means no pinned
/// subscriptions.
fn parse_subscriptions(raw: &str) -> Result<Vec<SubscriptionKey>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    let specs: Vec<SubscriptionSpec> =
        serde_json::from_str(raw).context("invalid SUBSCRIPTIONS JSON")?;
    let mut keys = Vec::new();
    for spec in specs {
        let key = SubscriptionKey::new(&spec.symbol, &spec.timeframe);
        if key.symbol.is_empty() || key.timeframe.is_empty() {
            anyhow::bail!("SUBSCRIPTIONS entry missing symbol or timeframe");
        }
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    Ok(keys)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let initial_subscriptions =
            parse_subscriptions(&env::var("SUBSCRIPTIONS").unwrap_or_default())?;

        let health = HealthConfig {
            check_interval: Duration::from_millis(env_u64("HEALTH_CHECK_INTERVAL_MS", 60_000)),
            stale_threshold_multiplier: env_f64("HEALTH_STALE_THRESHOLD_MULTIPLIER", 3.0),
            auto_recovery_enabled: env_bool("HEALTH_AUTO_RECOVERY_ENABLED", true),
            max_recovery_attempts: env_u32("HEALTH_MAX_RECOVERY_ATTEMPTS", 3),
            full_reconnect_threshold: env_u64("HEALTH_FULL_RECONNECT_THRESHOLD", 3) as usize,
            full_reconnect_cooldown: Duration::from_millis(env_u64(
                "HEALTH_FULL_RECONNECT_COOLDOWN_MS",
                600_000,
            )),
        };

        Ok(Self {
            proxy: env::var("TV_API_PROXY")
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            upstream_timeout: Duration::from_millis(env_u64("TV_API_TIMEOUT_MS", 10_000)),
            initial_subscriptions,
            backend_endpoint: env_str("BACKEND_ENDPOINT", ""),
            backend_api_key: env_str("BACKEND_API_KEY", ""),
            backend_retry_attempts: env_u32("BACKEND_RETRY_ATTEMPTS", 3),
            backend_retry_backoff: Duration::from_secs(env_u64("BACKEND_RETRY_BACKOFF_SEC", 1)),
            websocket_port: env_u16("WEBSOCKET_PORT", 8081),
            websocket_enabled: env_bool("WEBSOCKET_ENABLED", true),
            health_api_port: env_u16("HEALTH_API_PORT", 8082),
            metrics_port: env_u16("METRICS_PORT", 9100),
            log_level: env_str("LOG_LEVEL", "info"),
            log_file: env::var("LOG_FILE")
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            debug_prices: env_bool("DEBUG_PRICES", false),
            prices_log_file: env_str("PRICES_LOG_FILE", "prices.log"),
            health,
        })
    }

    pub fn push_enabled(&self) -> bool {
        !self.backend_endpoint.is_empty()
    }
}
