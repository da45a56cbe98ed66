//! WebSocket surfaces of the gateway.
//!
//! `/ws` serves viewers: a client subscribes to a deployment and receives
//! the accumulated log snapshot followed by ordered live frames. `/ws/ingest`
//! accepts frames relayed from workers running in other processes and feeds
//! them into the hub.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::hub::{LogFrame, LogHub};
use crate::store::DeploymentStatus;

use super::api::AppState;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── Frame types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe { deployment_id: String },
    Unsubscribe { deployment_id: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Snapshot {
        deployment_id: String,
        log: String,
        status: Option<DeploymentStatus>,
    },
    Log {
        deployment_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        fragment: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<DeploymentStatus>,
        timestamp: String,
    },
    Error {
        message: String,
    },
}

impl From<LogFrame> for ServerFrame {
    fn from(frame: LogFrame) -> Self {
        ServerFrame::Log {
            deployment_id: frame.deployment_id,
            fragment: frame.fragment,
            status: frame.status,
            timestamp: frame.timestamp,
        }
    }
}

// ── Viewer socket ────────────────────────────────────────────────────

pub async fn viewer_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_viewer(socket, state))
}

async fn handle_viewer(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(64);

    // One writer task owns the sink half; subscriptions and pings all
    // funnel through the channel so frame order per subscription holds.
    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let mut subscriptions: HashMap<String, tokio::task::JoinHandle<()>> = HashMap::new();
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    ping_interval.tick().await;
    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if out_tx.send(Message::Ping(axum::body::Bytes::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }
            incoming = receiver.next() => {
                let Some(Ok(message)) = incoming else { break };
                match message {
                    Message::Text(text) => {
                        match serde_json::from_str::<ClientFrame>(text.as_str()) {
                            Ok(ClientFrame::Subscribe { deployment_id }) => {
                                subscribe_viewer(&state, &deployment_id, &out_tx, &mut subscriptions)
                                    .await;
                            }
                            Ok(ClientFrame::Unsubscribe { deployment_id }) => {
                                if let Some(task) = subscriptions.remove(&deployment_id) {
                                    task.abort();
                                }
                                state.hub.sweep(&deployment_id);
                            }
                            Err(e) => {
                                let frame = ServerFrame::Error {
                                    message: format!("unrecognized frame: {}", e),
                                };
                                send_frame(&out_tx, &frame).await;
                            }
                        }
                    }
                    Message::Pong(_) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    for (deployment_id, task) in subscriptions {
        task.abort();
        state.hub.sweep(&deployment_id);
    }
    writer.abort();
}

async fn subscribe_viewer(
    state: &Arc<AppState>,
    deployment_id: &str,
    out_tx: &mpsc::Sender<Message>,
    subscriptions: &mut HashMap<String, tokio::task::JoinHandle<()>>,
) {
    let exists = state
        .store
        .call({
            let id = deployment_id.to_string();
            move |store| store.get_deployment(&id)
        })
        .await
        .ok()
        .flatten()
        .is_some();
    if !exists {
        let frame = ServerFrame::Error {
            message: format!("deployment {} not found", deployment_id),
        };
        send_frame(out_tx, &frame).await;
        return;
    }

    // Snapshot and receiver are taken atomically by the hub: the snapshot
    // is exactly the prefix preceding the first live frame.
    let (snapshot, mut rx) = state.hub.subscribe(deployment_id);
    let frame = ServerFrame::Snapshot {
        deployment_id: deployment_id.to_string(),
        log: snapshot.log,
        status: snapshot.status,
    };
    send_frame(out_tx, &frame).await;

    let out_tx = out_tx.clone();
    let task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(frame) => {
                    if !send_frame(&out_tx, &ServerFrame::from(frame)).await {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    // The viewer fell too far behind for the ordered stream
                    // to be gapless; tell it to resubscribe for a fresh
                    // snapshot instead of silently missing frames.
                    let frame = ServerFrame::Error {
                        message: format!("stream lagged by {} frames, resubscribe", skipped),
                    };
                    send_frame(&out_tx, &frame).await;
                    break;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    if let Some(previous) = subscriptions.insert(deployment_id.to_string(), task) {
        previous.abort();
    }
}

async fn send_frame(out_tx: &mpsc::Sender<Message>, frame: &ServerFrame) -> bool {
    match serde_json::to_string(frame) {
        Ok(text) => out_tx.send(Message::Text(text.into())).await.is_ok(),
        Err(e) => {
            warn!("failed to serialize server frame: {}", e);
            true
        }
    }
}

// ── Worker ingest socket ─────────────────────────────────────────────

pub async fn ingest_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let hub = Arc::clone(&state.hub);
    ws.on_upgrade(move |socket| handle_ingest(socket, hub))
}

async fn handle_ingest(mut socket: WebSocket, hub: Arc<LogHub>) {
    debug!("worker relay connected");
    while let Some(Ok(message)) = socket.next().await {
        match message {
            Message::Text(text) => match serde_json::from_str::<LogFrame>(text.as_str()) {
                Ok(frame) => hub.publish(frame),
                Err(e) => warn!("discarding malformed relay frame: {}", e),
            },
            Message::Ping(payload) => {
                let _ = socket.send(Message::Pong(payload)).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    debug!("worker relay disconnected");
}
