//! Subscription multiplexer.
//!
//! Owns the canonical `key → upstream chart` mapping and the upstream
//! session lifecycle. Many downstream interests collapse onto at most one
//! chart per key; listeners observe the stream through a broadcast channel
//! of [`MuxEvent`]s. Events are emitted only after the map mutation they
//! describe, so every listener sees committed state.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::driver::{Period, UpstreamChart, UpstreamClient};
use crate::metrics;
use crate::types::{Bar, MuxEvent, SubscriptionKey};

const EVENT_CHANNEL_CAPACITY: usize = 256;

const RECONNECT_BASE_SECS: f64 = 5.0;
const RECONNECT_FACTOR: f64 = 1.5;
const RECONNECT_CAP_SECS: f64 = 60.0;
const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Settle delay between closing and reopening the session on full reconnect.
const FULL_RECONNECT_SETTLE: Duration = Duration::from_secs(2);

struct SubEntry {
    chart: Box<dyn UpstreamChart>,
    last_bar_time: Arc<AtomicI64>,
    /// Gates the update callback: bars are dropped until the record is
    /// committed, so listeners always observe `Subscribed` before the first
    /// `Bar` for a key, and never after `Unsubscribed`.
    live: Arc<AtomicBool>,
}

pub struct Multiplexer {
    driver: Arc<dyn UpstreamClient>,
    subs: RwLock<HashMap<SubscriptionKey, SubEntry>>,
    events: broadcast::Sender<MuxEvent>,
    reconnect_attempts: AtomicU32,
    closed: CancellationToken,
}

impl Multiplexer {
    pub fn new(driver: Arc<dyn UpstreamClient>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            driver,
            subs: RwLock::new(HashMap::new()),
            events,
            reconnect_attempts: AtomicU32::new(0),
            closed: CancellationToken::new(),
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<MuxEvent> {
        self.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.driver.is_connected()
    }

    /// Bring up the upstream session with exponential backoff and jitter.
    ///
    /// An explicit call resets the attempt counter. Returns `false` once the
    /// budget is exhausted (`max_reconnect_attempts` emitted, no process
    /// exit) or the multiplexer was closed.
    pub async fn connect(&self) -> bool {
        self.reconnect_attempts.store(0, Ordering::Relaxed);
        loop {
            if self.closed.is_cancelled() {
                return false;
            }
            let attempt = self.reconnect_attempts.fetch_add(1, Ordering::Relaxed) + 1;
            match self.driver.connect().await {
                Ok(()) => {
                    info!("upstream connected (attempt {attempt})");
                    let _ = self.events.send(MuxEvent::Connect);
                    return true;
                }
                Err(e) => {
                    warn!("upstream connect attempt {attempt} failed: {e}");
                    let _ = self
                        .events
                        .send(MuxEvent::Error(format!("connect failed: {e}")));
                    if attempt >= MAX_RECONNECT_ATTEMPTS {
                        error!("reconnect budget exhausted after {attempt} attempts");
                        let _ = self.events.send(MuxEvent::MaxReconnectAttempts);
                        return false;
                    }
                    let delay = reconnect_delay(attempt);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.closed.cancelled() => return false,
                    }
                }
            }
        }
    }

    /// Create the upstream subscription for `key` if it does not exist yet.
    ///
    /// Idempotent: an existing subscription returns `true` with no side
    /// effect. Failure emits `subscription_error` and returns `false`.
    pub async fn subscribe(&self, key: &SubscriptionKey, reason: &str) -> bool {
        if self.subs.read().await.contains_key(key) {
            return true;
        }
        if !self.driver.is_connected() {
            warn!("subscribe {key} rejected: upstream not connected (reason={reason})");
            let _ = self.events.send(MuxEvent::SubscriptionError {
                key: key.clone(),
                message: "upstream not connected".to_string(),
            });
            return false;
        }

        let mut chart = match self.driver.chart().await {
            Ok(chart) => chart,
            Err(e) => {
                warn!("chart create failed for {key}: {e}");
                let _ = self.events.send(MuxEvent::SubscriptionError {
                    key: key.clone(),
                    message: e.to_string(),
                });
                return false;
            }
        };

        let last_bar_time = Arc::new(AtomicI64::new(0));
        let live = Arc::new(AtomicBool::new(false));

        let events = self.events.clone();
        let cb_key = key.clone();
        let cb_last = last_bar_time.clone();
        let cb_live = live.clone();
        chart.on_update(Box::new(move |period| {
            if !cb_live.load(Ordering::Acquire) {
                return;
            }
            if let Some(bar) = bar_from_period(&cb_key, period) {
                cb_last.fetch_max(bar.time, Ordering::Relaxed);
                let _ = events.send(MuxEvent::Bar(bar));
            }
        }));

        let events = self.events.clone();
        let cb_key = key.clone();
        chart.on_error(Box::new(move |message| {
            let _ = events.send(MuxEvent::SubscriptionError {
                key: cb_key.clone(),
                message,
            });
        }));

        let events = self.events.clone();
        let cb_key = key.clone();
        chart.on_symbol_loaded(Box::new(move || {
            let _ = events.send(MuxEvent::SymbolLoaded(cb_key.clone()));
        }));

        let mut subs = self.subs.write().await;
        if subs.contains_key(key) {
            // Lost a subscribe race; release the extra chart.
            if let Err(e) = chart.delete().await {
                debug!("duplicate chart teardown failed for {key}: {e}");
            }
            return true;
        }
        if let Err(e) = chart.set_market(&key.symbol, &key.timeframe).await {
            drop(subs);
            warn!("set_market failed for {key}: {e}");
            if let Err(e) = chart.delete().await {
                debug!("chart teardown after failed set_market for {key}: {e}");
            }
            let _ = self.events.send(MuxEvent::SubscriptionError {
                key: key.clone(),
                message: e.to_string(),
            });
            return false;
        }

        subs.insert(
            key.clone(),
            SubEntry {
                chart,
                last_bar_time,
                live: live.clone(),
            },
        );
        metrics::set_active_subscriptions(subs.len());
        info!("subscribed {key} (reason={reason})");
        let _ = self.events.send(MuxEvent::Subscribed(key.clone()));
        live.store(true, Ordering::Release);
        true
    }

    /// Tear down the subscription for `(symbol, timeframe)`.
    ///
    /// Removal from the map is unconditional; chart teardown errors are
    /// logged, not propagated.
    pub async fn unsubscribe(&self, symbol: &str, timeframe: &str) -> bool {
        let key = SubscriptionKey::new(symbol, timeframe);
        let entry = {
            let mut subs = self.subs.write().await;
            let entry = subs.remove(&key);
            if entry.is_some() {
                metrics::set_active_subscriptions(subs.len());
            }
            entry
        };
        let Some(mut entry) = entry else {
            warn!("unsubscribe {key}: no active subscription");
            return false;
        };
        entry.live.store(false, Ordering::Release);
        if let Err(e) = entry.chart.delete().await {
            warn!("chart teardown failed for {key}: {e}");
        }
        let _ = self.events.send(MuxEvent::Unsubscribed(key.clone()));
        info!("unsubscribed {key}");
        true
    }

    pub async fn list(&self) -> Vec<SubscriptionKey> {
        let mut keys: Vec<_> = self.subs.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn subscription_count(&self) -> usize {
        self.subs.read().await.len()
    }

    /// Snapshot of `(key, last bar time)` pairs for status reporting.
    pub async fn snapshot(&self) -> Vec<(SubscriptionKey, i64)> {
        let subs = self.subs.read().await;
        let mut out: Vec<_> = subs
            .iter()
            .map(|(k, e)| (k.clone(), e.last_bar_time.load(Ordering::Relaxed)))
            .collect();
        out.sort();
        out
    }

    /// Reconcile the active set against `desired`: removed keys first, then
    /// additions, so a re-keyed symbol never collides upstream.
    pub async fn update_subscriptions(
        &self,
        desired: &[SubscriptionKey],
        reason: &str,
    ) -> (usize, usize, usize) {
        let current: HashSet<SubscriptionKey> =
            self.subs.read().await.keys().cloned().collect();
        let desired_set: HashSet<SubscriptionKey> = desired.iter().cloned().collect();

        let removed: Vec<SubscriptionKey> =
            current.difference(&desired_set).cloned().collect();
        let added: Vec<SubscriptionKey> = desired
            .iter()
            .filter(|k| !current.contains(*k))
            .cloned()
            .collect();

        for key in &removed {
            self.unsubscribe(&key.symbol, &key.timeframe).await;
        }
        let mut restored = 0;
        for key in &added {
            if self.subscribe(key, reason).await {
                restored += 1;
            }
        }
        info!(
            "subscriptions updated (reason={reason}): removed={} added={} restored={}",
            removed.len(),
            added.len(),
            restored
        );
        (removed.len(), added.len(), restored)
    }

    /// Tear down every chart best-effort and clear the map.
    pub async fn reset_all(&self) {
        let entries: Vec<(SubscriptionKey, SubEntry)> = {
            let mut subs = self.subs.write().await;
            let drained = subs.drain().collect();
            metrics::set_active_subscriptions(0);
            drained
        };
        for (key, mut entry) in entries {
            entry.live.store(false, Ordering::Release);
            if let Err(e) = entry.chart.delete().await {
                debug!("chart teardown failed for {key} during reset: {e}");
            }
        }
    }

    /// Snapshot keys → tear down the session → settle → reopen →
    /// re-apply the snapshot. `true` only on complete success; on failure
    /// the health monitor re-attempts after its cooldown.
    pub async fn full_reconnect(&self) -> bool {
        metrics::record_full_reconnect();
        let snapshot = self.list().await;
        info!("full reconnect: restoring {} subscriptions", snapshot.len());

        self.driver.end().await;
        let _ = self.events.send(MuxEvent::Disconnect);
        self.reset_all().await;

        tokio::time::sleep(FULL_RECONNECT_SETTLE).await;

        if let Err(e) = self.driver.connect().await {
            error!("full reconnect failed: {e}");
            let _ = self
                .events
                .send(MuxEvent::Error(format!("full reconnect failed: {e}")));
            return false;
        }
        let _ = self.events.send(MuxEvent::Connect);

        let (_removed, added, restored) = self
            .update_subscriptions(&snapshot, "full_reconnect")
            .await;
        restored == added
    }

    /// Orderly teardown: cancel any pending reconnect sleep, release every
    /// chart, close the session, emit `disconnect`.
    pub async fn close(&self) {
        self.closed.cancel();
        self.reset_all().await;
        self.driver.end().await;
        let _ = self.events.send(MuxEvent::Disconnect);
        info!("multiplexer closed");
    }
}

/// Convert a provider period to a canonical bar.
///
/// `max`/`min` are accepted as synonyms for `high`/`low`; a period carrying
/// neither form is dropped. Missing volume defaults to 0.
pub fn bar_from_period(key: &SubscriptionKey, period: &Period) -> Option<Bar> {
    let high = period.high.or(period.max)?;
    let low = period.low.or(period.min)?;
    Some(Bar {
        symbol: key.symbol.clone(),
        timeframe: key.timeframe.clone(),
        time: period.time,
        open: period.open,
        high,
        low,
        close: period.close,
        volume: period.volume.unwrap_or(0.0),
    })
}

fn reconnect_delay(attempt: u32) -> Duration {
    let jitter = 1.0 + rand::thread_rng().gen_range(0.0..0.2);
    let secs = RECONNECT_BASE_SECS * RECONNECT_FACTOR.powi(attempt as i32 - 1) * jitter;
    Duration::from_secs_f64(secs.min(RECONNECT_CAP_SECS))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SubscriptionKey {
        SubscriptionKey::new("BINANCE:BTCUSDT", "1")
    }

    #[test]
    fn period_with_high_low() {
        let p = Period {
            time: 1_700_000_000,
            open: 1.0,
            close: 1.5,
            volume: Some(10.0),
            high: Some(2.0),
            low: Some(0.5),
            max: None,
            min: None,
        };
        let bar = bar_from_period(&key(), &p).unwrap();
        assert_eq!(bar.high, 2.0);
        assert_eq!(bar.low, 0.5);
        assert_eq!(bar.volume, 10.0);
    }

    #[test]
    fn period_accepts_max_min_synonyms() {
        let p = Period {
            time: 1_700_000_000,
            open: 1.0,
            close: 1.5,
            volume: None,
            high: None,
            low: None,
            max: Some(2.0),
            min: Some(0.5),
        };
        let bar = bar_from_period(&key(), &p).unwrap();
        assert_eq!(bar.high, 2.0);
        assert_eq!(bar.low, 0.5);
        assert_eq!(bar.volume, 0.0);
    }

    #[test]
    fn period_without_extremes_is_dropped() {
        let p = Period {
            time: 1_700_000_000,
            open: 1.0,
            close: 1.5,
            ..Period::default()
        };
        assert!(bar_from_period(&key(), &p).is_none());
    }

    #[test]
    fn reconnect_delay_is_bounded() {
        for attempt in 1..=MAX_RECONNECT_ATTEMPTS {
            let d = reconnect_delay(attempt);
            assert!(d >= Duration::from_secs_f64(RECONNECT_BASE_SECS));
            assert!(d <= Duration::from_secs_f64(RECONNECT_CAP_SECS));
        }
        // First attempt stays within base + 20% jitter.
        let first = reconnect_delay(1);
        assert!(first <= Duration::from_secs_f64(RECONNECT_BASE_SECS * 1.2));
    }
}
