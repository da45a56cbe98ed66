//! Log broadcast hub: per-deployment rooms relaying build output and
//! status transitions from workers to any number of live viewers.
//!
//! Subscribing atomically returns the full accumulated log plus current
//! status, then a live stream of subsequent frames. Both `publish` and
//! `subscribe` run under the same room lock, so no frame published after
//! the snapshot can be missed and none is delivered twice.

pub mod relay;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::store::DeploymentStatus;

pub use relay::RelaySink;

const CHANNEL_CAPACITY: usize = 1024;

/// One incremental chunk of build output and/or a status transition,
/// as published by a worker and fanned out to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogFrame {
    pub deployment_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub fragment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub status: Option<DeploymentStatus>,
    pub timestamp: String,
}

impl LogFrame {
    pub fn log(deployment_id: &str, fragment: &str, status: Option<DeploymentStatus>) -> Self {
        Self {
            deployment_id: deployment_id.to_string(),
            fragment: Some(fragment.to_string()),
            status,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn status(deployment_id: &str, status: DeploymentStatus) -> Self {
        Self {
            deployment_id: deployment_id.to_string(),
            fragment: None,
            status: Some(status),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Snapshot returned to a subscriber at the instant it joins.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub log: String,
    pub status: Option<DeploymentStatus>,
}

struct Room {
    history: String,
    status: Option<DeploymentStatus>,
    tx: broadcast::Sender<LogFrame>,
}

impl Room {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            history: String::new(),
            status: None,
            tx,
        }
    }
}

/// Pub-sub relay with per-deployment ordering and late-joiner replay.
pub struct LogHub {
    rooms: Mutex<HashMap<String, Room>>,
}

impl Default for LogHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LogHub {
    pub fn new() -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
        }
    }

    /// Publish a frame: append to the room history and fan out to all
    /// current subscribers in one critical section.
    pub fn publish(&self, frame: LogFrame) {
        let mut rooms = self.rooms.lock().expect("hub lock poisoned");
        let room = rooms
            .entry(frame.deployment_id.clone())
            .or_insert_with(Room::new);
        if let Some(fragment) = &frame.fragment {
            room.history.push_str(fragment);
        }
        if let Some(status) = frame.status {
            room.status = Some(status);
        }
        // No receivers is fine; history still accumulates for late joiners.
        let _ = room.tx.send(frame);
    }

    /// Join a room: the returned snapshot is exactly the prefix of the
    /// final log preceding the first frame the receiver will observe.
    pub fn subscribe(&self, deployment_id: &str) -> (Snapshot, broadcast::Receiver<LogFrame>) {
        let mut rooms = self.rooms.lock().expect("hub lock poisoned");
        let room = rooms
            .entry(deployment_id.to_string())
            .or_insert_with(Room::new);
        let snapshot = Snapshot {
            log: room.history.clone(),
            status: room.status,
        };
        (snapshot, room.tx.subscribe())
    }

    /// Drop a room once its deployment is terminal and nobody is watching.
    pub fn sweep(&self, deployment_id: &str) {
        let mut rooms = self.rooms.lock().expect("hub lock poisoned");
        let retired = rooms.get(deployment_id).is_some_and(|room| {
            room.status.is_some_and(|s| s.is_terminal()) && room.tx.receiver_count() == 0
        });
        if retired {
            rooms.remove(deployment_id);
        }
    }

    /// Number of live rooms (operational visibility).
    pub fn room_count(&self) -> usize {
        self.rooms.lock().expect("hub lock poisoned").len()
    }
}

/// Destination for worker-emitted log frames. Workers are handed a sink at
/// construction instead of reaching for process-global state; the sink is
/// either the in-process hub or a relay to a remote gateway.
pub trait LogSink: Send + Sync {
    fn publish_log(&self, deployment_id: &str, fragment: &str, status: Option<DeploymentStatus>);
    fn publish_status(&self, deployment_id: &str, status: DeploymentStatus);
}

/// Sink publishing straight into a hub in the same process.
pub struct LocalSink {
    hub: Arc<LogHub>,
}

impl LocalSink {
    pub fn new(hub: Arc<LogHub>) -> Self {
        Self { hub }
    }
}

impl LogSink for LocalSink {
    fn publish_log(&self, deployment_id: &str, fragment: &str, status: Option<DeploymentStatus>) {
        self.hub.publish(LogFrame::log(deployment_id, fragment, status));
    }

    fn publish_status(&self, deployment_id: &str, status: DeploymentStatus) {
        self.hub.publish(LogFrame::status(deployment_id, status));
    }
}
