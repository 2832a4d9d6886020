//! Client websocket front.
//!
//! Accepts connections, parses the request protocol, and drives the session
//! registry. Each session has one writer task merging two sources: its
//! private response outbox and the shared bar broadcast. A lagging client
//! skips the oldest bar frames (counted in `ws_dropped_frames_total`) and
//! never delays fan-out to others.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::StreamExt;
use futures_util::SinkExt;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::metrics;
use crate::protocol::{greeting_frame, ClientRequest, PairResult, Response};
use crate::registry::{Registry, SessionId, SubscribeOutcome, UnsubscribeOutcome};
use crate::types::SubscriptionKey;

/// Per-session response outbox depth.
const OUTBOX_CAPACITY: usize = 64;

#[derive(Clone)]
pub struct FrontState {
    pub registry: Arc<Registry>,
    pub bars: broadcast::Sender<String>,
}

pub fn front_router(state: FrontState) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .with_state(state)
}

pub async fn serve_on(
    listener: TcpListener,
    state: FrontState,
    cancel: CancellationToken,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("websocket server listening on {addr}");
    }
    axum::serve(listener, front_router(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .context("websocket server")?;
    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<FrontState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: FrontState) {
    metrics::record_client_connect();
    let (mut sender, mut receiver) = socket.split();

    let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOX_CAPACITY);
    let mut bar_rx = state.bars.subscribe();

    let session = state.registry.register().await;
    debug!("client session {session} connected");

    // One writer per session keeps frame order; slow sessions only lose
    // their own oldest bar frames.
    let writer = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                msg = out_rx.recv() => match msg {
                    Some(frame) => frame,
                    None => break,
                },
                bar = bar_rx.recv() => match bar {
                    Ok(frame) => frame,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        metrics::record_dropped_frames(n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };
            if sender.send(Message::Text(frame.into())).await.is_err() {
                // Closed transport mid-broadcast; cleanup happens on the
                // read side.
                metrics::record_client_error();
                break;
            }
        }
    });

    let _ = out_tx.send(greeting_frame()).await;

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let frame = dispatch(&state, session, text.as_str()).await;
                if out_tx.send(frame).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    state.registry.disconnect(session).await;
    writer.abort();
    debug!("client session {session} disconnected");
}

async fn dispatch(state: &FrontState, session: SessionId, text: &str) -> String {
    let req: ClientRequest = match serde_json::from_str(text) {
        Ok(req) => req,
        Err(_) => {
            metrics::record_client_error();
            return Response::error("Invalid JSON message").to_frame();
        }
    };
    let request_id = req.request_id.clone();

    let response = match req.action.as_str() {
        "subscribe" => handle_subscribe(state, session, &req).await,
        "unsubscribe" => handle_unsubscribe(state, session, &req).await,
        "subscribe_many" => handle_bulk(state, session, &req, true).await,
        "unsubscribe_many" => handle_bulk(state, session, &req, false).await,
        "list" => {
            let keys = state.registry.list().await;
            Response::new("list", true, format!("{} active subscription(s)", keys.len()))
                .with_subscriptions(&keys)
        }
        other => {
            metrics::record_client_error();
            Response::error(format!("Unknown action: {other}"))
        }
    };
    response.with_request_id(request_id).to_frame()
}

fn required_key(req: &ClientRequest) -> Option<SubscriptionKey> {
    let symbol = req.symbol.as_deref()?.trim();
    let timeframe = req.timeframe.as_deref()?.trim();
    if symbol.is_empty() || timeframe.is_empty() {
        return None;
    }
    Some(SubscriptionKey::new(symbol, timeframe))
}

async fn handle_subscribe(state: &FrontState, session: SessionId, req: &ClientRequest) -> Response {
    let Some(key) = required_key(req) else {
        metrics::record_client_error();
        return Response::error("symbol and timeframe required");
    };
    let response = match state.registry.subscribe(session, key.clone()).await {
        SubscribeOutcome::Created => Response::new("subscribe", true, "Subscription created"),
        SubscribeOutcome::Shared => Response::new("subscribe", true, "Subscribed (shared)"),
        SubscribeOutcome::AlreadySubscribed => {
            Response::new("subscribe", true, "Already subscribed")
        }
        SubscribeOutcome::Failed(message) => Response::new("subscribe", false, message),
    };
    response.with_key(&key)
}

async fn handle_unsubscribe(
    state: &FrontState,
    session: SessionId,
    req: &ClientRequest,
) -> Response {
    let Some(key) = required_key(req) else {
        metrics::record_client_error();
        return Response::error("symbol and timeframe required");
    };
    let response = match state.registry.unsubscribe(session, &key).await {
        UnsubscribeOutcome::NotSubscribed => Response::new(
            "unsubscribe",
            false,
            "Subscription not found for this client",
        ),
        UnsubscribeOutcome::Removed | UnsubscribeOutcome::RemovedLast => {
            Response::new("unsubscribe", true, "Unsubscribed successfully")
        }
    };
    response.with_key(&key)
}

/// Bulk operations process each pair independently; the top-level `success`
/// reflects only request shape (a non-empty `pairs` array).
async fn handle_bulk(
    state: &FrontState,
    session: SessionId,
    req: &ClientRequest,
    subscribe: bool,
) -> Response {
    let Some(pairs) = req.pairs.as_ref().filter(|pairs| !pairs.is_empty()) else {
        metrics::record_client_error();
        return Response::error("pairs array required");
    };

    let mut results = Vec::with_capacity(pairs.len());
    for pair in pairs {
        if pair.symbol.trim().is_empty() || pair.timeframe.trim().is_empty() {
            results.push(PairResult {
                symbol: pair.symbol.clone(),
                timeframe: pair.timeframe.clone(),
                success: false,
                message: "symbol and timeframe required".to_string(),
            });
            continue;
        }
        let key = SubscriptionKey::new(&pair.symbol, &pair.timeframe);
        let (success, message) = if subscribe {
            match state.registry.subscribe(session, key.clone()).await {
                SubscribeOutcome::Created => (true, "Subscription created".to_string()),
                SubscribeOutcome::Shared => (true, "Subscribed (shared)".to_string()),
                SubscribeOutcome::AlreadySubscribed => (true, "Already subscribed".to_string()),
                SubscribeOutcome::Failed(message) => (false, message),
            }
        } else {
            match state.registry.unsubscribe(session, &key).await {
                UnsubscribeOutcome::NotSubscribed => (
                    false,
                    "Subscription not found for this client".to_string(),
                ),
                UnsubscribeOutcome::Removed | UnsubscribeOutcome::RemovedLast => {
                    (true, "Unsubscribed successfully".to_string())
                }
            }
        };
        results.push(PairResult {
            symbol: key.symbol,
            timeframe: key.timeframe,
            success,
            message,
        });
    }

    let snapshot = state.registry.list().await;
    let kind = if subscribe {
        "subscribe_many"
    } else {
        "unsubscribe_many"
    };
    Response::new(kind, true, format!("Processed {} pair(s)", results.len()))
        .with_results(results)
        .with_subscriptions(&snapshot)
}
