//! Counting mock of the upstream driver contract, shared by the
//! integration suites.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;

use tvws_broker::driver::{ErrorFn, LoadedFn, Period, UpdateFn, UpstreamChart, UpstreamClient};

#[derive(Default)]
struct Callbacks {
    update: Option<UpdateFn>,
    error: Option<ErrorFn>,
    loaded: Option<LoadedFn>,
}

struct ChartState {
    market: Mutex<Option<(String, String)>>,
    callbacks: Mutex<Callbacks>,
    deleted: AtomicBool,
}

#[derive(Default)]
struct Shared {
    connected: AtomicBool,
    fail_connects: AtomicU32,
    connects: AtomicUsize,
    ends: AtomicUsize,
    charts_created: AtomicUsize,
    charts_deleted: AtomicUsize,
    charts: Mutex<Vec<Arc<ChartState>>>,
}

#[derive(Default)]
pub struct MockDriver {
    shared: Arc<Shared>,
}

impl MockDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `n` connect calls fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.shared.fail_connects.store(n, Ordering::Relaxed);
    }

    pub fn connects(&self) -> usize {
        self.shared.connects.load(Ordering::Relaxed)
    }

    pub fn ends(&self) -> usize {
        self.shared.ends.load(Ordering::Relaxed)
    }

    pub fn charts_created(&self) -> usize {
        self.shared.charts_created.load(Ordering::Relaxed)
    }

    pub fn charts_deleted(&self) -> usize {
        self.shared.charts_deleted.load(Ordering::Relaxed)
    }

    pub fn live_charts(&self) -> usize {
        self.shared
            .charts
            .lock()
            .unwrap()
            .iter()
            .filter(|c| !c.deleted.load(Ordering::Relaxed))
            .count()
    }

    /// Fire the update callback of the live chart bound to `(symbol,
    /// timeframe)`. Returns whether a chart was found.
    pub fn emit_period(&self, symbol: &str, timeframe: &str, period: &Period) -> bool {
        let charts = self.shared.charts.lock().unwrap();
        for chart in charts.iter() {
            if chart.deleted.load(Ordering::Relaxed) {
                continue;
            }
            let bound = chart
                .market
                .lock()
                .unwrap()
                .as_ref()
                .is_some_and(|(s, t)| s == symbol && t == timeframe);
            if !bound {
                continue;
            }
            let callbacks = chart.callbacks.lock().unwrap();
            if let Some(cb) = callbacks.update.as_ref() {
                cb(period);
                return true;
            }
        }
        false
    }

    /// Fire the error callback of the chart bound to `(symbol, timeframe)`.
    pub fn emit_error(&self, symbol: &str, timeframe: &str, message: &str) -> bool {
        let charts = self.shared.charts.lock().unwrap();
        for chart in charts.iter() {
            let bound = chart
                .market
                .lock()
                .unwrap()
                .as_ref()
                .is_some_and(|(s, t)| s == symbol && t == timeframe);
            if !bound {
                continue;
            }
            let callbacks = chart.callbacks.lock().unwrap();
            if let Some(cb) = callbacks.error.as_ref() {
                cb(message.to_string());
                return true;
            }
        }
        false
    }
}

#[async_trait]
impl UpstreamClient for MockDriver {
    async fn connect(&self) -> Result<()> {
        self.shared.connects.fetch_add(1, Ordering::Relaxed);
        let remaining = self.shared.fail_connects.load(Ordering::Relaxed);
        if remaining > 0 {
            self.shared
                .fail_connects
                .store(remaining - 1, Ordering::Relaxed);
            bail!("mock connect failure");
        }
        self.shared.connected.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Relaxed)
    }

    async fn chart(&self) -> Result<Box<dyn UpstreamChart>> {
        if !self.is_connected() {
            bail!("not connected");
        }
        self.shared.charts_created.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(ChartState {
            market: Mutex::new(None),
            callbacks: Mutex::new(Callbacks::default()),
            deleted: AtomicBool::new(false),
        });
        self.shared.charts.lock().unwrap().push(state.clone());
        Ok(Box::new(MockChart {
            state,
            shared: self.shared.clone(),
        }))
    }

    async fn end(&self) {
        self.shared.ends.fetch_add(1, Ordering::Relaxed);
        self.shared.connected.store(false, Ordering::Relaxed);
    }
}

struct MockChart {
    state: Arc<ChartState>,
    shared: Arc<Shared>,
}

#[async_trait]
impl UpstreamChart for MockChart {
    fn on_update(&mut self, cb: UpdateFn) {
        self.state.callbacks.lock().unwrap().update = Some(cb);
    }

    fn on_error(&mut self, cb: ErrorFn) {
        self.state.callbacks.lock().unwrap().error = Some(cb);
    }

    fn on_symbol_loaded(&mut self, cb: LoadedFn) {
        self.state.callbacks.lock().unwrap().loaded = Some(cb);
    }

    async fn set_market(&mut self, symbol: &str, timeframe: &str) -> Result<()> {
        if !self.shared.connected.load(Ordering::Relaxed) {
            bail!("not connected");
        }
        *self.state.market.lock().unwrap() = Some((symbol.to_string(), timeframe.to_string()));
        let callbacks = self.state.callbacks.lock().unwrap();
        if let Some(cb) = callbacks.loaded.as_ref() {
            cb();
        }
        Ok(())
    }

    async fn delete(&mut self) -> Result<()> {
        if !self.state.deleted.swap(true, Ordering::Relaxed) {
            self.shared.charts_deleted.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}
