//! Upstream driver contract.
//!
//! The multiplexer consumes this interface and nothing else; the production
//! adapter lives in [`tv`] and tests substitute a counting mock. A session
//! hands out per-instrument chart handles which deliver period updates via
//! registered callbacks.

pub mod tv;

use anyhow::Result;
use async_trait::async_trait;

/// Latest period object as reported by the provider.
///
/// Providers disagree on field names for the extremes: some send
/// `high`/`low`, others `max`/`min`. Both are carried here and reconciled
/// when converting to a [`crate::types::Bar`]. A missing `volume` defaults
/// to zero at the same point.
#[derive(Debug, Clone, Default)]
pub struct Period {
    /// Period open time, unix seconds.
    pub time: i64,
    pub open: f64,
    pub close: f64,
    pub volume: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub max: Option<f64>,
    pub min: Option<f64>,
}

pub type UpdateFn = Box<dyn Fn(&Period) + Send + Sync>;
pub type ErrorFn = Box<dyn Fn(String) + Send + Sync>;
pub type LoadedFn = Box<dyn Fn() + Send + Sync>;

/// A per-instrument chart handle. Callbacks must be registered before
/// `set_market` starts the data flow.
#[async_trait]
pub trait UpstreamChart: Send + Sync {
    fn on_update(&mut self, cb: UpdateFn);
    fn on_error(&mut self, cb: ErrorFn);
    fn on_symbol_loaded(&mut self, cb: LoadedFn);

    /// Configure the chart for `(symbol, timeframe)` and start updates.
    async fn set_market(&mut self, symbol: &str, timeframe: &str) -> Result<()>;

    /// Release the chart upstream.
    async fn delete(&mut self) -> Result<()>;
}

/// An upstream session. One per broker process.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Open the session. Idempotent when already connected.
    async fn connect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Open a fresh chart handle on the current session.
    async fn chart(&self) -> Result<Box<dyn UpstreamChart>>;

    /// Close the session. Chart handles become dead; teardown calls on them
    /// after this point may fail and are treated as best-effort.
    async fn end(&self);
}
