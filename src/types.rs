//! Core value types shared across the broker.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::timeframe;

/// Canonical identity of one logical stream: `(symbol, normalized timeframe)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionKey {
    pub symbol: String,
    pub timeframe: String,
}

impl SubscriptionKey {
    /// Build a key, normalizing the timeframe at the boundary.
    pub fn new(symbol: &str, timeframe: &str) -> Self {
        Self {
            symbol: symbol.trim().to_string(),
            timeframe: timeframe::normalize(timeframe),
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.symbol, self.timeframe)
    }
}

/// One OHLCV sample as it flows through the system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub timeframe: String,
    /// Bar open time, unix seconds.
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    pub fn key(&self) -> SubscriptionKey {
        SubscriptionKey {
            symbol: self.symbol.clone(),
            timeframe: self.timeframe.clone(),
        }
    }
}

/// Events emitted by the multiplexer to its listeners.
///
/// Emission always happens after the owning map mutation, so listeners only
/// ever observe committed state.
#[derive(Debug, Clone)]
pub enum MuxEvent {
    /// Upstream session established.
    Connect,
    /// Upstream session closed.
    Disconnect,
    Bar(Bar),
    Subscribed(SubscriptionKey),
    Unsubscribed(SubscriptionKey),
    /// Chart symbol resolved upstream.
    SymbolLoaded(SubscriptionKey),
    /// Session-level error (connect failure, read error).
    Error(String),
    /// Per-subscription error (chart create/configure failure, chart error callback).
    SubscriptionError {
        key: SubscriptionKey,
        message: String,
    },
    /// Reconnect budget exhausted; operator intervention required.
    MaxReconnectAttempts,
}
