//! TradingView websocket adapter.
//!
//! Implements the driver contract over the provider's framed text protocol:
//! every payload travels as `~m~{len}~m~{json}`, heartbeats as `~h~{n}` and
//! must be echoed verbatim. One read task dispatches series updates to the
//! chart that owns the session id; a writer task serializes all outgoing
//! frames.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use super::{ErrorFn, LoadedFn, Period, UpdateFn, UpstreamChart, UpstreamClient};

pub const DEFAULT_WS_URL: &str = "wss://data.tradingview.com/socket.io/websocket?type=chart";

#[derive(Debug, Clone)]
pub struct TvConfig {
    pub ws_url: String,
    /// Proxy URL; tunneled with a plain HTTP CONNECT before the TLS handshake.
    pub proxy: Option<String>,
    pub timeout: Duration,
}

impl TvConfig {
    pub fn new(proxy: Option<String>, timeout: Duration) -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            proxy,
            timeout,
        }
    }
}

#[derive(Default)]
struct ChartCallbacks {
    update: Option<UpdateFn>,
    error: Option<ErrorFn>,
    loaded: Option<LoadedFn>,
}

struct ChartShared {
    callbacks: StdMutex<ChartCallbacks>,
}

type ChartMap = Arc<StdMutex<HashMap<String, Arc<ChartShared>>>>;

struct SessionInner {
    out_tx: mpsc::UnboundedSender<String>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// TradingView session client. One websocket, many chart sessions.
pub struct TvClient {
    cfg: TvConfig,
    connected: Arc<AtomicBool>,
    charts: ChartMap,
    session: Mutex<Option<SessionInner>>,
    next_chart_id: AtomicU64,
}

impl TvClient {
    pub fn new(cfg: TvConfig) -> Self {
        Self {
            cfg,
            connected: Arc::new(AtomicBool::new(false)),
            charts: Arc::new(StdMutex::new(HashMap::new())),
            session: Mutex::new(None),
            next_chart_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl UpstreamClient for TvClient {
    async fn connect(&self) -> Result<()> {
        let mut guard = self.session.lock().await;
        if guard.is_some() && self.connected.load(Ordering::Relaxed) {
            return Ok(());
        }

        // A previous session may have died without `end()`.
        if let Some(old) = guard.take() {
            old.reader.abort();
            old.writer.abort();
        }

        let ws = tokio::time::timeout(self.cfg.timeout, open_stream(&self.cfg))
            .await
            .context("upstream connect timed out")??;
        let (mut sink, mut stream) = ws.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

        let writer = tokio::spawn(async move {
            while let Some(payload) = out_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(encode_frame(&payload).into())).await {
                    warn!("upstream write failed: {e}");
                    break;
                }
            }
        });

        let charts = self.charts.clone();
        let connected = self.connected.clone();
        let heartbeat_tx = out_tx.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        for frame in decode_frames(text.as_str()) {
                            if frame.starts_with("~h~") {
                                // Heartbeat must be echoed or the server drops us.
                                let _ = heartbeat_tx.send(frame);
                                continue;
                            }
                            match serde_json::from_str::<Value>(&frame) {
                                Ok(v) => dispatch(&charts, &v),
                                Err(e) => debug!("unparseable upstream frame: {e}"),
                            }
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        warn!("upstream close: {frame:?}");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("upstream read error: {e}");
                        break;
                    }
                }
            }
            connected.store(false, Ordering::Relaxed);
        });

        out_tx
            .send(json!({"m": "set_auth_token", "p": ["unauthorized_user_token"]}).to_string())
            .map_err(|_| anyhow!("upstream writer closed during handshake"))?;

        *guard = Some(SessionInner {
            out_tx,
            reader,
            writer,
        });
        self.connected.store(true, Ordering::Relaxed);
        debug!("upstream session established: {}", self.cfg.ws_url);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn chart(&self) -> Result<Box<dyn UpstreamChart>> {
        let guard = self.session.lock().await;
        let sess = guard.as_ref().ok_or_else(|| anyhow!("not connected"))?;
        let out_tx = sess.out_tx.clone();
        drop(guard);

        let n = self.next_chart_id.fetch_add(1, Ordering::Relaxed);
        let session_id = format!("cs_{n:06x}");

        let shared = Arc::new(ChartShared {
            callbacks: StdMutex::new(ChartCallbacks::default()),
        });
        self.charts
            .lock()
            .unwrap()
            .insert(session_id.clone(), shared.clone());

        out_tx
            .send(json!({"m": "chart_create_session", "p": [session_id, ""]}).to_string())
            .map_err(|_| anyhow!("upstream session closed"))?;

        Ok(Box::new(TvChart {
            session_id,
            out_tx,
            charts: self.charts.clone(),
            shared,
            series_created: false,
        }))
    }

    async fn end(&self) {
        let mut guard = self.session.lock().await;
        if let Some(sess) = guard.take() {
            sess.reader.abort();
            sess.writer.abort();
        }
        self.charts.lock().unwrap().clear();
        self.connected.store(false, Ordering::Relaxed);
    }
}

struct TvChart {
    session_id: String,
    out_tx: mpsc::UnboundedSender<String>,
    charts: ChartMap,
    shared: Arc<ChartShared>,
    series_created: bool,
}

impl TvChart {
    fn send(&self, method: &str, params: Value) -> Result<()> {
        let msg = json!({"m": method, "p": params}).to_string();
        self.out_tx
            .send(msg)
            .map_err(|_| anyhow!("upstream session closed"))
    }
}

#[async_trait]
impl UpstreamChart for TvChart {
    fn on_update(&mut self, cb: UpdateFn) {
        self.shared.callbacks.lock().unwrap().update = Some(cb);
    }

    fn on_error(&mut self, cb: ErrorFn) {
        self.shared.callbacks.lock().unwrap().error = Some(cb);
    }

    fn on_symbol_loaded(&mut self, cb: LoadedFn) {
        self.shared.callbacks.lock().unwrap().loaded = Some(cb);
    }

    async fn set_market(&mut self, symbol: &str, timeframe: &str) -> Result<()> {
        self.send(
            "resolve_symbol",
            json!([self.session_id, "sds_sym_1", symbol]),
        )?;
        if self.series_created {
            self.send(
                "modify_series",
                json!([self.session_id, "sds_1", "s1", "sds_sym_1", timeframe]),
            )?;
        } else {
            self.send(
                "create_series",
                json!([self.session_id, "sds_1", "s1", "sds_sym_1", timeframe, 1]),
            )?;
            self.series_created = true;
        }
        Ok(())
    }

    async fn delete(&mut self) -> Result<()> {
        self.charts.lock().unwrap().remove(&self.session_id);
        self.send("chart_delete_session", json!([self.session_id]))
    }
}

fn dispatch(charts: &ChartMap, v: &Value) {
    let method = v.get("m").and_then(|m| m.as_str()).unwrap_or("");
    let params = match v.get("p").and_then(|p| p.as_array()) {
        Some(p) => p,
        None => return,
    };
    let session_id = params.first().and_then(|s| s.as_str()).unwrap_or("");
    let shared = match charts.lock().unwrap().get(session_id).cloned() {
        Some(s) => s,
        None => return,
    };

    match method {
        "timescale_update" | "du" => {
            if let Some(period) = extract_period(params.get(1)) {
                let cbs = shared.callbacks.lock().unwrap();
                if let Some(cb) = cbs.update.as_ref() {
                    cb(&period);
                }
            }
        }
        "symbol_resolved" => {
            let cbs = shared.callbacks.lock().unwrap();
            if let Some(cb) = cbs.loaded.as_ref() {
                cb();
            }
        }
        "symbol_error" | "series_error" | "critical_error" | "protocol_error" => {
            let detail = params
                .get(1)
                .map(|p| p.to_string())
                .unwrap_or_else(|| method.to_string());
            let cbs = shared.callbacks.lock().unwrap();
            if let Some(cb) = cbs.error.as_ref() {
                cb(format!("{method}: {detail}"));
            }
        }
        _ => {}
    }
}

/// Pull the latest period out of a `timescale_update`/`du` payload.
///
/// The payload maps series ids to `{"s": [{"i": n, "v": [time, open, high,
/// low, close, volume?]}, ...]}`; the last entry is the current period.
fn extract_period(data: Option<&Value>) -> Option<Period> {
    let obj = data?.as_object()?;
    for series in obj.values() {
        let items = match series.get("s").and_then(|s| s.as_array()) {
            Some(items) if !items.is_empty() => items,
            _ => continue,
        };
        let v = items.last()?.get("v")?.as_array()?;
        if v.len() < 5 {
            return None;
        }
        return Some(Period {
            time: v[0].as_f64()? as i64,
            open: v[1].as_f64()?,
            high: v[2].as_f64(),
            low: v[3].as_f64(),
            close: v[4].as_f64()?,
            volume: v.get(5).and_then(|x| x.as_f64()),
            max: None,
            min: None,
        });
    }
    None
}

fn encode_frame(payload: &str) -> String {
    format!("~m~{}~m~{}", payload.len(), payload)
}

fn decode_frames(raw: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = raw;
    while let Some(stripped) = rest.strip_prefix("~m~") {
        let idx = match stripped.find("~m~") {
            Some(idx) => idx,
            None => break,
        };
        let len: usize = match stripped[..idx].parse() {
            Ok(n) => n,
            Err(_) => break,
        };
        let body_start = idx + 3;
        let body = match stripped.get(body_start..body_start + len) {
            Some(b) => b,
            None => break,
        };
        out.push(body.to_string());
        rest = &stripped[body_start + len..];
    }
    out
}

async fn open_stream(cfg: &TvConfig) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>> {
    let mut request = cfg
        .ws_url
        .as_str()
        .into_client_request()
        .context("build ws request")?;
    // The data edge rejects connections without a browser Origin.
    request.headers_mut().insert(
        "Origin",
        HeaderValue::from_static("https://www.tradingview.com"),
    );

    if let Some(proxy) = cfg.proxy.as_deref() {
        let stream = proxy_connect(proxy, &cfg.ws_url).await?;
        let (ws, _resp) = tokio_tungstenite::client_async_tls(request, stream)
            .await
            .context("ws handshake via proxy")?;
        Ok(ws)
    } else {
        let (ws, _resp) = tokio_tungstenite::connect_async(request)
            .await
            .context("ws connect")?;
        Ok(ws)
    }
}

/// Open a raw TCP tunnel to the target through an HTTP proxy.
async fn proxy_connect(proxy_url: &str, target_url: &str) -> Result<TcpStream> {
    let proxy = Url::parse(proxy_url).context("bad TV_API_PROXY")?;
    let proxy_host = proxy
        .host_str()
        .ok_or_else(|| anyhow!("proxy url missing host"))?;
    let proxy_port = proxy.port_or_known_default().unwrap_or(8080);

    let target = Url::parse(target_url).context("bad upstream url")?;
    let target_host = target
        .host_str()
        .ok_or_else(|| anyhow!("upstream url missing host"))?;
    let target_port = target.port().unwrap_or(443);

    let mut stream = TcpStream::connect((proxy_host, proxy_port))
        .await
        .context("proxy connect")?;

    let connect_req = format!(
        "CONNECT {target_host}:{target_port} HTTP/1.1\r\nHost: {target_host}:{target_port}\r\n\r\n"
    );
    stream.write_all(connect_req.as_bytes()).await?;

    let mut head = [0u8; 1024];
    let mut filled = 0;
    loop {
        let n = stream.read(&mut head[filled..]).await?;
        if n == 0 {
            bail!("proxy closed during CONNECT");
        }
        filled += n;
        if head[..filled].windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if filled == head.len() {
            bail!("proxy CONNECT response too large");
        }
    }

    let response = std::str::from_utf8(&head[..filled]).unwrap_or("");
    let status_line = response.lines().next().unwrap_or("");
    if !status_line.contains(" 200") {
        bail!("proxy CONNECT failed: {status_line}");
    }
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let payload = r#"{"m":"ping","p":[]}"#;
        let framed = encode_frame(payload);
        assert_eq!(framed, format!("~m~{}~m~{}", payload.len(), payload));
        assert_eq!(decode_frames(&framed), vec![payload.to_string()]);
    }

    #[test]
    fn decodes_concatenated_frames() {
        let raw = format!("{}{}", encode_frame("~h~12"), encode_frame(r#"{"m":"x"}"#));
        let frames = decode_frames(&raw);
        assert_eq!(frames, vec!["~h~12".to_string(), r#"{"m":"x"}"#.to_string()]);
    }

    #[test]
    fn decode_tolerates_garbage() {
        assert!(decode_frames("no frames here").is_empty());
        assert!(decode_frames("~m~999~m~short").is_empty());
    }

    #[test]
    fn extracts_latest_period() {
        let data = serde_json::json!({
            "sds_1": {
                "s": [
                    {"i": 0, "v": [1_700_000_000.0, 1.0, 2.0, 0.5, 1.5, 10.0]},
                    {"i": 1, "v": [1_700_000_060.0, 1.5, 2.5, 1.0, 2.0, 12.5]}
                ]
            }
        });
        let p = extract_period(Some(&data)).unwrap();
        assert_eq!(p.time, 1_700_000_060);
        assert_eq!(p.open, 1.5);
        assert_eq!(p.high, Some(2.5));
        assert_eq!(p.low, Some(1.0));
        assert_eq!(p.close, 2.0);
        assert_eq!(p.volume, Some(12.5));
    }

    #[test]
    fn extract_period_handles_missing_volume() {
        let data = serde_json::json!({
            "sds_1": {"s": [{"i": 0, "v": [1_700_000_000.0, 1.0, 2.0, 0.5, 1.5]}]}
        });
        let p = extract_period(Some(&data)).unwrap();
        assert_eq!(p.volume, None);
    }
}
