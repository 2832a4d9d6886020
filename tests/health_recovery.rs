//! Health monitor: staleness detection, per-key recovery with a bounded
//! attempt budget, and the full-reconnect threshold with cooldown.

mod common;

use std::time::Duration;

use common::MockDriver;
use tvws_broker::health::{HealthConfig, HealthMonitor};
use tvws_broker::mux::Multiplexer;
use tvws_broker::types::{MuxEvent, SubscriptionKey};

/// A multiplier of zero marks every key stale on the next scan, which lets
/// the suite drive scans without waiting out real timeframes.
fn aggressive_config() -> HealthConfig {
    HealthConfig {
        stale_threshold_multiplier: 0.0,
        full_reconnect_threshold: 100,
        ..HealthConfig::default()
    }
}

#[tokio::test]
async fn fresh_keys_are_not_recovered() {
    let driver = MockDriver::new();
    let mux = Multiplexer::new(driver.clone());
    assert!(mux.connect().await);
    let key = SubscriptionKey::new("BINANCE:BTCUSDT", "1");
    assert!(mux.subscribe(&key, "test").await);

    let cfg = HealthConfig {
        full_reconnect_threshold: 100,
        ..HealthConfig::default()
    };
    let monitor = HealthMonitor::new(cfg, mux.clone());
    monitor.note_event(&MuxEvent::Subscribed(key.clone())).await;

    monitor.scan_once().await;
    assert_eq!(driver.charts_created(), 1);
    assert_eq!(driver.charts_deleted(), 0);
    assert_eq!(monitor.stale_count().await, 0);
}

#[tokio::test]
async fn first_sighting_starts_the_clock_instead_of_recovering() {
    let driver = MockDriver::new();
    let mux = Multiplexer::new(driver.clone());
    assert!(mux.connect().await);
    let key = SubscriptionKey::new("BINANCE:BTCUSDT", "1");
    assert!(mux.subscribe(&key, "test").await);

    // No subscribed event seen; the first scan only seeds the timestamp.
    let monitor = HealthMonitor::new(aggressive_config(), mux.clone());
    monitor.scan_once().await;
    assert_eq!(driver.charts_created(), 1);
    assert_eq!(monitor.stale_count().await, 0);
}

#[tokio::test]
async fn stale_key_triggers_individual_recovery() {
    let driver = MockDriver::new();
    let mux = Multiplexer::new(driver.clone());
    assert!(mux.connect().await);
    let key = SubscriptionKey::new("BINANCE:BTCUSDT", "1");
    assert!(mux.subscribe(&key, "test").await);

    let monitor = HealthMonitor::new(aggressive_config(), mux.clone());
    monitor.note_event(&MuxEvent::Subscribed(key.clone())).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    monitor.scan_once().await;

    // Recovery tears the chart down and recreates it.
    assert_eq!(driver.charts_deleted(), 1);
    assert_eq!(driver.charts_created(), 2);
    assert_eq!(mux.subscription_count().await, 1);
}

#[tokio::test]
async fn recovery_budget_is_enforced() {
    let driver = MockDriver::new();
    let mux = Multiplexer::new(driver.clone());
    assert!(mux.connect().await);
    let key = SubscriptionKey::new("BINANCE:BTCUSDT", "1");
    assert!(mux.subscribe(&key, "test").await);

    let cfg = HealthConfig {
        max_recovery_attempts: 1,
        ..aggressive_config()
    };
    let monitor = HealthMonitor::new(cfg, mux.clone());
    monitor.note_event(&MuxEvent::Subscribed(key.clone())).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    monitor.scan_once().await;
    assert_eq!(driver.charts_created(), 2);

    // Budget spent; the next scan must not touch the driver again.
    tokio::time::sleep(Duration::from_millis(20)).await;
    monitor.scan_once().await;
    assert_eq!(driver.charts_created(), 2);
    assert_eq!(driver.charts_deleted(), 1);
}

#[tokio::test]
async fn bar_arrival_resets_the_budget() {
    let driver = MockDriver::new();
    let mux = Multiplexer::new(driver.clone());
    assert!(mux.connect().await);
    let key = SubscriptionKey::new("BINANCE:BTCUSDT", "1");
    assert!(mux.subscribe(&key, "test").await);

    let cfg = HealthConfig {
        max_recovery_attempts: 1,
        ..aggressive_config()
    };
    let monitor = HealthMonitor::new(cfg, mux.clone());
    monitor.note_event(&MuxEvent::Subscribed(key.clone())).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    monitor.scan_once().await;
    assert_eq!(driver.charts_created(), 2);

    // A fresh bar clears the attempt counter, re-arming recovery.
    monitor
        .note_event(&MuxEvent::Bar(tvws_broker::types::Bar {
            symbol: key.symbol.clone(),
            timeframe: key.timeframe.clone(),
            time: 1_700_000_000,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 1.0,
        }))
        .await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    monitor.scan_once().await;
    assert_eq!(driver.charts_created(), 3);
}

#[tokio::test]
async fn auto_recovery_can_be_disabled() {
    let driver = MockDriver::new();
    let mux = Multiplexer::new(driver.clone());
    assert!(mux.connect().await);
    let key = SubscriptionKey::new("BINANCE:BTCUSDT", "1");
    assert!(mux.subscribe(&key, "test").await);

    let cfg = HealthConfig {
        auto_recovery_enabled: false,
        ..aggressive_config()
    };
    let monitor = HealthMonitor::new(cfg, mux.clone());
    monitor.note_event(&MuxEvent::Subscribed(key.clone())).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    monitor.scan_once().await;

    // Stale is reported but nothing is touched.
    assert_eq!(monitor.stale_count().await, 1);
    assert_eq!(driver.charts_created(), 1);
    assert_eq!(driver.charts_deleted(), 0);
}

#[tokio::test]
async fn stale_threshold_triggers_one_full_reconnect_per_cooldown() {
    let driver = MockDriver::new();
    let mux = Multiplexer::new(driver.clone());
    assert!(mux.connect().await);

    let keys = [
        SubscriptionKey::new("A", "1"),
        SubscriptionKey::new("B", "1"),
        SubscriptionKey::new("C", "1"),
    ];
    for key in &keys {
        assert!(mux.subscribe(key, "test").await);
    }

    let cfg = HealthConfig {
        stale_threshold_multiplier: 0.0,
        full_reconnect_threshold: 3,
        ..HealthConfig::default()
    };
    let monitor = HealthMonitor::new(cfg, mux.clone());
    for key in &keys {
        monitor.note_event(&MuxEvent::Subscribed(key.clone())).await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    monitor.scan_once().await;
    assert_eq!(driver.ends(), 1);
    assert_eq!(mux.subscription_count().await, 3);

    // Everything is stale again immediately, but the cooldown holds the
    // session-level hammer back; only per-key recovery may run.
    tokio::time::sleep(Duration::from_millis(20)).await;
    monitor.scan_once().await;
    assert_eq!(driver.ends(), 1);
}

#[tokio::test]
async fn operator_recovery_follows_the_same_path() {
    let driver = MockDriver::new();
    let mux = Multiplexer::new(driver.clone());
    assert!(mux.connect().await);
    let key = SubscriptionKey::new("BINANCE:BTCUSDT", "1");
    assert!(mux.subscribe(&key, "test").await);

    let monitor = HealthMonitor::new(HealthConfig::default(), mux.clone());
    assert!(monitor.recover_subscription(&key).await);
    assert_eq!(driver.charts_deleted(), 1);
    assert_eq!(driver.charts_created(), 2);
}
