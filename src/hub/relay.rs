//! Worker-side relay: ships log frames to a gateway's ingest socket.
//!
//! Workers may run in a separate process from the viewer-facing gateway.
//! Frames published while the gateway is unreachable are held in an
//! explicit bounded queue and flushed in order on reconnection rather
//! than dropped; at capacity the oldest frame is discarded with a warning.

use std::collections::VecDeque;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::{LogFrame, LogSink};
use crate::store::DeploymentStatus;

/// Maximum frames held while the gateway is unreachable.
const PENDING_CAP: usize = 10_000;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Sink that forwards frames over a WebSocket to a remote hub, buffering
/// across disconnects. Publishing never blocks the build pipeline.
pub struct RelaySink {
    tx: mpsc::UnboundedSender<LogFrame>,
}

impl RelaySink {
    /// Spawn the background relay task and return the sink.
    pub fn spawn(ingest_url: String) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(relay_loop(ingest_url, rx));
        Self { tx }
    }
}

impl LogSink for RelaySink {
    fn publish_log(&self, deployment_id: &str, fragment: &str, status: Option<DeploymentStatus>) {
        let _ = self.tx.send(LogFrame::log(deployment_id, fragment, status));
    }

    fn publish_status(&self, deployment_id: &str, status: DeploymentStatus) {
        let _ = self.tx.send(LogFrame::status(deployment_id, status));
    }
}

fn buffer_push(pending: &mut VecDeque<LogFrame>, frame: LogFrame) {
    if pending.len() >= PENDING_CAP {
        pending.pop_front();
        warn!("relay buffer full, dropping oldest frame");
    }
    pending.push_back(frame);
}

async fn relay_loop(url: String, mut rx: mpsc::UnboundedReceiver<LogFrame>) {
    let mut pending: VecDeque<LogFrame> = VecDeque::new();

    loop {
        match connect_async(url.as_str()).await {
            Ok((mut ws, _)) => {
                info!(url = %url, buffered = pending.len(), "relay connected to gateway");

                // Flush everything queued while disconnected, in order.
                let mut flush_ok = true;
                while let Some(frame) = pending.front() {
                    let text = match serde_json::to_string(frame) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("failed to serialize log frame, dropping: {}", e);
                            pending.pop_front();
                            continue;
                        }
                    };
                    if ws.send(Message::text(text)).await.is_err() {
                        flush_ok = false;
                        break;
                    }
                    pending.pop_front();
                }

                if flush_ok {
                    loop {
                        tokio::select! {
                            maybe = rx.recv() => match maybe {
                                Some(frame) => {
                                    let text = match serde_json::to_string(&frame) {
                                        Ok(text) => text,
                                        Err(e) => {
                                            warn!("failed to serialize log frame, dropping: {}", e);
                                            continue;
                                        }
                                    };
                                    if ws.send(Message::text(text)).await.is_err() {
                                        buffer_push(&mut pending, frame);
                                        break;
                                    }
                                }
                                None => {
                                    // All sinks dropped: worker is done.
                                    let _ = ws.close(None).await;
                                    return;
                                }
                            },
                            incoming = ws.next() => {
                                match incoming {
                                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                                    _ => {}
                                }
                            }
                        }
                    }
                }
                debug!("relay disconnected from gateway");
            }
            Err(e) => {
                debug!(url = %url, "relay connect failed: {}", e);
            }
        }

        // Back off before reconnecting, absorbing frames into the bounded
        // buffer so nothing published meanwhile is lost.
        let backoff = tokio::time::sleep(RECONNECT_DELAY);
        tokio::pin!(backoff);
        loop {
            tokio::select! {
                _ = &mut backoff => break,
                maybe = rx.recv() => match maybe {
                    Some(frame) => buffer_push(&mut pending, frame),
                    None => return,
                }
            }
        }
    }
}
