//! HTTP push sink.
//!
//! Bars are queued to a single worker so a slow backend can never block the
//! websocket fan-out; the queue is bounded and lossy under overload. Each
//! bar gets `1 + retry_attempts` delivery attempts with a fixed backoff.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use reqwest::Client;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::metrics;
use crate::types::Bar;

const PUSH_QUEUE_CAPACITY: usize = 512;

#[derive(Debug, Clone)]
pub struct PushConfig {
    pub endpoint: String,
    pub api_key: String,
    /// Retries after the first attempt.
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
}

#[derive(Clone)]
pub struct PushHandle {
    tx: mpsc::Sender<Bar>,
}

impl PushHandle {
    pub fn enqueue(&self, bar: &Bar) {
        if self.tx.try_send(bar.clone()).is_err() {
            warn!(
                "push queue saturated, dropping bar {}/{} t={}",
                bar.symbol, bar.timeframe, bar.time
            );
        }
    }
}

/// Start the push worker and return its enqueue handle.
pub fn start(cfg: PushConfig) -> Result<PushHandle> {
    let client = Client::builder()
        .user_agent("tvws-broker")
        .build()
        .context("build push http client")?;
    let (tx, mut rx) = mpsc::channel::<Bar>(PUSH_QUEUE_CAPACITY);
    tokio::spawn(async move {
        while let Some(bar) = rx.recv().await {
            push_bar(&client, &cfg, &bar).await;
        }
    });
    Ok(PushHandle { tx })
}

/// Deliver one bar, retrying on failure. Returns whether any attempt
/// succeeded; after the last attempt the bar is logged and dropped.
pub async fn push_bar(client: &Client, cfg: &PushConfig, bar: &Bar) -> bool {
    let payload = json!({
        "symbol": bar.symbol,
        "time": bar.time,
        "open": bar.open,
        "high": bar.high,
        "low": bar.low,
        "close": bar.close,
        "volume": bar.volume,
        "timeframe": bar.timeframe,
    });

    let total_attempts = cfg.retry_attempts + 1;
    for attempt in 1..=total_attempts {
        let start = Instant::now();
        let result = client
            .post(&cfg.endpoint)
            .header("X-Api-Key", cfg.api_key.as_str())
            .json(&payload)
            .send()
            .await;
        metrics::record_push_latency(start.elapsed().as_secs_f64());

        match result {
            Ok(resp) if resp.status().is_success() => {
                metrics::record_bar_pushed();
                return true;
            }
            Ok(resp) => {
                warn!(
                    "push attempt {attempt}/{total_attempts} got HTTP {}",
                    resp.status()
                );
            }
            Err(e) => {
                warn!("push attempt {attempt}/{total_attempts} failed: {e}");
            }
        }
        if attempt < total_attempts {
            tokio::time::sleep(cfg.retry_backoff).await;
        }
    }

    error!(
        "dropping bar {}/{} t={} after {total_attempts} push attempts",
        bar.symbol, bar.timeframe, bar.time
    );
    false
}
