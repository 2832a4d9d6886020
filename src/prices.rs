//! Optional bar mirror: appends every bar as a JSON line to a dedicated
//! file when `DEBUG_PRICES` is on. A dedicated writer thread keeps file IO
//! off the async runtime; the feed channel is bounded and lossy.

use std::fs::OpenOptions;
use std::io::Write;
use std::sync::mpsc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;

use crate::types::Bar;

const QUEUE_CAPACITY: usize = 1024;

pub struct PriceLog {
    tx: mpsc::SyncSender<Bar>,
}

impl PriceLog {
    pub fn start(path: &str) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open prices log {path}"))?;

        let (tx, rx) = mpsc::sync_channel::<Bar>(QUEUE_CAPACITY);
        std::thread::spawn(move || {
            while let Ok(bar) = rx.recv() {
                let line = json!({
                    "ts": Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                    "symbol": bar.symbol,
                    "timeframe": bar.timeframe,
                    "time": bar.time,
                    "open": bar.open,
                    "high": bar.high,
                    "low": bar.low,
                    "close": bar.close,
                    "volume": bar.volume,
                })
                .to_string();
                if let Err(e) = writeln!(file, "{line}") {
                    eprintln!("prices log write failed: {e}");
                    break;
                }
            }
        });

        Ok(Self { tx })
    }

    pub fn record(&self, bar: &Bar) {
        let _ = self.tx.try_send(bar.clone());
    }
}
