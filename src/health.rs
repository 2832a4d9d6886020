//! Health monitor: per-subscription staleness detection and recovery.
//!
//! Consumes the multiplexer's event stream to keep a last-seen timestamp per
//! key, scans on a timer, and drives targeted resubscription. When enough
//! keys go stale at once the whole upstream session is suspect and a full
//! reconnect is triggered instead, rate-limited by a cooldown.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::metrics;
use crate::mux::Multiplexer;
use crate::timeframe;
use crate::types::{MuxEvent, SubscriptionKey};

/// Settle delay between unsubscribe and resubscribe during recovery.
const RECOVERY_SETTLE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub check_interval: Duration,
    /// A key is stale when `now − last_bar > timeframe_ms × multiplier`.
    pub stale_threshold_multiplier: f64,
    pub auto_recovery_enabled: bool,
    pub max_recovery_attempts: u32,
    /// Stale count that triggers a full reconnect instead of per-key recovery.
    pub full_reconnect_threshold: usize,
    pub full_reconnect_cooldown: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_millis(60_000),
            stale_threshold_multiplier: 3.0,
            auto_recovery_enabled: true,
            max_recovery_attempts: 3,
            full_reconnect_threshold: 3,
            full_reconnect_cooldown: Duration::from_millis(600_000),
        }
    }
}

/// Events emitted by the monitor for observers (tooling, tests).
#[derive(Debug, Clone)]
pub enum HealthEvent {
    RecoverySuccess(SubscriptionKey),
    RecoveryFailure(SubscriptionKey),
    MaxRecoveryAttempts(SubscriptionKey),
    FullReconnect { success: bool },
}

#[derive(Default)]
struct HealthState {
    last_bar: HashMap<SubscriptionKey, Instant>,
    attempts: HashMap<SubscriptionKey, u32>,
    /// Keys currently mid-recovery. Their self-inflicted `unsubscribed`
    /// events must not wipe the attempt counter.
    recovering: HashSet<SubscriptionKey>,
    last_full_reconnect: Option<Instant>,
    stale_count: usize,
}

pub struct HealthMonitor {
    cfg: HealthConfig,
    mux: Arc<Multiplexer>,
    state: Mutex<HealthState>,
    events: broadcast::Sender<HealthEvent>,
    cancel: CancellationToken,
    active: AtomicBool,
}

impl HealthMonitor {
    pub fn new(cfg: HealthConfig, mux: Arc<Multiplexer>) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            cfg,
            mux,
            state: Mutex::new(HealthState::default()),
            events,
            cancel: CancellationToken::new(),
            active: AtomicBool::new(false),
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &HealthConfig {
        &self.cfg
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub async fn stale_count(&self) -> usize {
        self.state.lock().await.stale_count
    }

    /// Spawn the event listener and the periodic scan.
    pub fn start(self: &Arc<Self>) {
        self.active.store(true, Ordering::Relaxed);

        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut rx = monitor.mux.subscribe_events();
            loop {
                tokio::select! {
                    _ = monitor.cancel.cancelled() => break,
                    ev = rx.recv() => match ev {
                        Ok(ev) => monitor.note_event(&ev).await,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("health monitor lagged {n} events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(monitor.cfg.check_interval);
            tick.tick().await; // arm
            loop {
                tokio::select! {
                    _ = monitor.cancel.cancelled() => break,
                    _ = tick.tick() => monitor.scan_once().await,
                }
            }
        });
    }

    /// Cancel the scan timer and detach the event listener. In-flight
    /// recovery calls run to completion.
    pub fn stop(&self) {
        self.active.store(false, Ordering::Relaxed);
        self.cancel.cancel();
    }

    /// Fold one multiplexer event into the timestamp bookkeeping.
    pub async fn note_event(&self, event: &MuxEvent) {
        let now = Instant::now();
        let mut st = self.state.lock().await;
        match event {
            MuxEvent::Bar(bar) => {
                let key = bar.key();
                st.last_bar.insert(key.clone(), now);
                st.attempts.remove(&key);
                metrics::set_last_data_age(&key.symbol, &key.timeframe, 0.0);
            }
            MuxEvent::Subscribed(key) => {
                st.last_bar.insert(key.clone(), now);
            }
            MuxEvent::Unsubscribed(key) => {
                if st.recovering.contains(key) {
                    // Recovery's own teardown; the key comes right back.
                    return;
                }
                st.last_bar.remove(key);
                st.attempts.remove(key);
            }
            MuxEvent::Connect => {
                for ts in st.last_bar.values_mut() {
                    *ts = now;
                }
                st.attempts.clear();
            }
            // Timestamps represent last-known data; keep them across drops.
            MuxEvent::Disconnect => {}
            _ => {}
        }
    }

    /// One scan pass. Called by the timer; public so tests and tools can
    /// drive ticks deterministically.
    pub async fn scan_once(&self) {
        let keys = self.mux.list().await;
        let now = Instant::now();
        let mut stale: Vec<SubscriptionKey> = Vec::new();
        let full_reconnect_due;
        {
            let mut st = self.state.lock().await;
            for key in keys {
                let ts = match st.last_bar.get(&key) {
                    Some(ts) => *ts,
                    None => {
                        // First sighting; start the clock now.
                        st.last_bar.insert(key, now);
                        continue;
                    }
                };
                let age = now.duration_since(ts);
                metrics::set_last_data_age(&key.symbol, &key.timeframe, age.as_secs_f64());
                let limit_ms = timeframe::timeframe_ms(&key.timeframe) as f64
                    * self.cfg.stale_threshold_multiplier;
                if age.as_secs_f64() * 1000.0 > limit_ms {
                    stale.push(key);
                }
            }
            st.stale_count = stale.len();
            metrics::set_stale_subscriptions(stale.len());

            let cooldown_over = st
                .last_full_reconnect
                .map(|t| now.duration_since(t) > self.cfg.full_reconnect_cooldown)
                .unwrap_or(true);
            full_reconnect_due = self.cfg.auto_recovery_enabled
                && stale.len() >= self.cfg.full_reconnect_threshold
                && cooldown_over;
            if full_reconnect_due {
                st.last_full_reconnect = Some(now);
            }
        }

        if stale.is_empty() {
            return;
        }
        warn!(
            "{} stale subscription(s): {}",
            stale.len(),
            stale
                .iter()
                .map(|k| k.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );

        if full_reconnect_due {
            // One full reconnect covers every stale key; skip individual
            // recovery this cycle.
            let ok = self.mux.full_reconnect().await;
            let mut st = self.state.lock().await;
            let now = Instant::now();
            for ts in st.last_bar.values_mut() {
                *ts = now;
            }
            st.attempts.clear();
            st.stale_count = 0;
            metrics::set_stale_subscriptions(0);
            let _ = self.events.send(HealthEvent::FullReconnect { success: ok });
            if ok {
                info!("full reconnect completed");
            } else {
                warn!("full reconnect failed; next attempt after cooldown");
            }
            return;
        }

        if !self.cfg.auto_recovery_enabled {
            return;
        }
        for key in stale {
            self.recover_subscription(&key).await;
        }
    }

    /// Resubscribe one key: tear down, settle, re-create. Bounded by the
    /// per-key attempt budget, which only a fresh bar (or session-level
    /// reset) clears.
    pub async fn recover_subscription(&self, key: &SubscriptionKey) -> bool {
        {
            let mut st = self.state.lock().await;
            let attempts = st.attempts.entry(key.clone()).or_insert(0);
            if *attempts >= self.cfg.max_recovery_attempts {
                warn!(
                    "recovery budget exhausted for {key} ({} attempts)",
                    *attempts
                );
                let _ = self
                    .events
                    .send(HealthEvent::MaxRecoveryAttempts(key.clone()));
                return false;
            }
            *attempts += 1;
            st.recovering.insert(key.clone());
        }
        metrics::record_recovery_attempt();
        info!("recovering {key}: resubscribing");

        self.mux.unsubscribe(&key.symbol, &key.timeframe).await;
        tokio::time::sleep(RECOVERY_SETTLE).await;
        let ok = self.mux.subscribe(key, "health_recovery").await;

        let mut st = self.state.lock().await;
        st.recovering.remove(key);
        if ok {
            st.last_bar.insert(key.clone(), Instant::now());
            metrics::record_recovery_success();
            let _ = self.events.send(HealthEvent::RecoverySuccess(key.clone()));
            info!("recovery succeeded for {key}");
        } else {
            metrics::record_recovery_failure();
            let _ = self.events.send(HealthEvent::RecoveryFailure(key.clone()));
            warn!("recovery failed for {key}");
        }
        ok
    }
}
