//! Client-facing message protocol: one JSON object per websocket frame.

use serde::{Deserialize, Serialize};

use crate::types::{Bar, SubscriptionKey};

pub const GREETING: &str = "Connected to TradingView WebSocket Server";

/// Request frame. `pairs` is only meaningful for the bulk actions.
#[derive(Debug, Deserialize)]
pub struct ClientRequest {
    pub action: String,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub timeframe: Option<String>,
    #[serde(default)]
    pub pairs: Option<Vec<PairSpec>>,
    #[serde(default, rename = "requestId")]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairSpec {
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub timeframe: String,
}

impl From<&SubscriptionKey> for PairSpec {
    fn from(key: &SubscriptionKey) -> Self {
        Self {
            symbol: key.symbol.clone(),
            timeframe: key.timeframe.clone(),
        }
    }
}

/// Per-pair outcome inside a bulk response.
#[derive(Debug, Serialize)]
pub struct PairResult {
    pub symbol: String,
    pub timeframe: String,
    pub success: bool,
    pub message: String,
}

/// Response frame. Fields absent from a given response kind are skipped.
#[derive(Debug, Serialize)]
pub struct Response {
    #[serde(rename = "type")]
    pub kind: String,
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeframe: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<PairResult>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscriptions: Option<Vec<PairSpec>>,
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl Response {
    pub fn new(kind: &str, success: bool, message: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            success,
            message: message.into(),
            symbol: None,
            timeframe: None,
            results: None,
            subscriptions: None,
            request_id: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new("error", false, message)
    }

    pub fn with_key(mut self, key: &SubscriptionKey) -> Self {
        self.symbol = Some(key.symbol.clone());
        self.timeframe = Some(key.timeframe.clone());
        self
    }

    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn with_results(mut self, results: Vec<PairResult>) -> Self {
        self.results = Some(results);
        self
    }

    pub fn with_subscriptions(mut self, keys: &[SubscriptionKey]) -> Self {
        self.subscriptions = Some(keys.iter().map(PairSpec::from).collect());
        self
    }

    pub fn to_frame(&self) -> String {
        serde_json::to_string(self).expect("response serialization")
    }
}

/// The unsolicited frame sent on accept.
pub fn greeting_frame() -> String {
    Response::new("info", true, GREETING).to_frame()
}

#[derive(Debug, Serialize)]
struct BarFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    bar: &'a Bar,
}

/// `{type:"bar", bar:{...}}` broadcast frame, serialized once per bar.
pub fn bar_frame(bar: &Bar) -> String {
    serde_json::to_string(&BarFrame { kind: "bar", bar }).expect("bar serialization")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_subscribe() {
        let req: ClientRequest = serde_json::from_str(
            r#"{"action":"subscribe","symbol":"BINANCE:BTCUSDT","timeframe":"1","requestId":"r1"}"#,
        )
        .unwrap();
        assert_eq!(req.action, "subscribe");
        assert_eq!(req.symbol.as_deref(), Some("BINANCE:BTCUSDT"));
        assert_eq!(req.request_id.as_deref(), Some("r1"));
        assert!(req.pairs.is_none());
    }

    #[test]
    fn parses_bulk_pairs() {
        let req: ClientRequest = serde_json::from_str(
            r#"{"action":"subscribe_many","pairs":[{"symbol":"X","timeframe":"5"},{"symbol":"","timeframe":""}]}"#,
        )
        .unwrap();
        let pairs = req.pairs.unwrap();
        assert_eq!(pairs.len(), 2);
        assert!(pairs[1].symbol.is_empty());
    }

    #[test]
    fn response_skips_absent_fields() {
        let resp = Response::new("subscribe", true, "Subscription created")
            .with_key(&SubscriptionKey::new("X", "1"));
        let v: serde_json::Value = serde_json::from_str(&resp.to_frame()).unwrap();
        assert_eq!(v["type"], "subscribe");
        assert_eq!(v["symbol"], "X");
        assert!(v.get("requestId").is_none());
        assert!(v.get("results").is_none());
    }

    #[test]
    fn error_response_shape() {
        let v: serde_json::Value =
            serde_json::from_str(&Response::error("Invalid JSON message").to_frame()).unwrap();
        assert_eq!(v["type"], "error");
        assert_eq!(v["success"], false);
        assert_eq!(v["message"], "Invalid JSON message");
    }

    #[test]
    fn bar_frame_shape() {
        let bar = Bar {
            symbol: "X".into(),
            timeframe: "1".into(),
            time: 1_700_000_000,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 10.0,
        };
        let v: serde_json::Value = serde_json::from_str(&bar_frame(&bar)).unwrap();
        assert_eq!(v["type"], "bar");
        assert_eq!(v["bar"]["symbol"], "X");
        assert_eq!(v["bar"]["time"], 1_700_000_000);
    }
}
