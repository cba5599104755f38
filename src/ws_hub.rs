//! WebSocket subscriber registry and broadcast (C8).
//!
//! The registry (monotonic subscriber id, single-lock snapshot-then-
//! concurrent-send-then-reap broadcast) is grounded on
//! `examples/original_source/backend/app/websocket_manager.py::ConnectionManager`.
//! The axum handshake mechanics (`WebSocketUpgrade`, `on_upgrade`,
//! `socket.split()`) are grounded on
//! `examples/other_examples/aa066705_vnxfsc-BREACH__backend-src-websocket-mod.rs.rs`;
//! its per-geohash-prefix channel partitioning is intentionally not carried
//! over here, since every subscriber receives every anomaly regardless of
//! location.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures::future;
use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use metrics::{counter, describe_counter};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::models::Anomaly;

/// A tagged frame sent from server to client over `/ws/anomalies`.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ServerFrame<'a> {
    #[serde(rename = "connection_status")]
    ConnectionStatus { status: &'a str, message: &'a str, timestamp: chrono::DateTime<Utc> },
    #[serde(rename = "recent_anomaly")]
    RecentAnomaly { payload: &'a Anomaly },
    #[serde(rename = "new_anomaly")]
    NewAnomaly { payload: &'a Anomaly },
    #[serde(rename = "pong")]
    Pong { timestamp: chrono::DateTime<Utc>, message: &'a str },
}

type Subscriber = Mutex<SplitSink<WebSocket, Message>>;

/// The subscriber registry. One instance is shared across the whole process.
pub struct WsHub {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
}

impl WsHub {
    pub fn new() -> Arc<WsHub> {
        describe_counter!(
            "air_quality.broadcast.delivered.count",
            "Anomaly broadcast messages delivered to WebSocket subscribers"
        );
        describe_counter!(
            "air_quality.broadcast.failed.count",
            "Anomaly broadcast sends that failed and caused subscriber removal"
        );
        Arc::new(WsHub {
            next_id: AtomicU64::new(0),
            subscribers: Mutex::new(HashMap::new()),
        })
    }

    /// Register a split sender half under a freshly assigned id.
    async fn connect(&self, sender: SplitSink<WebSocket, Message>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut subscribers = self.subscribers.lock().await;
        subscribers.insert(id, Mutex::new(sender));
        info!("WebSocket client {id} connected, total {}", subscribers.len());
        id
    }

    async fn disconnect(&self, id: u64) {
        let mut subscribers = self.subscribers.lock().await;
        if subscribers.remove(&id).is_some() {
            info!("WebSocket client {id} disconnected, remaining {}", subscribers.len());
        }
    }

    /// Broadcast an anomaly to every connected subscriber concurrently.
    /// Snapshots the registry under the lock, sends without holding it, then
    /// reaps any subscriber whose send failed.
    pub async fn broadcast(&self, anomaly: Anomaly) {
        let frame = ServerFrame::NewAnomaly { payload: &anomaly };
        let payload = match serde_json::to_string(&frame) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("could not serialize anomaly broadcast: {err}");
                return;
            }
        };

        let ids: Vec<u64> = {
            let subscribers = self.subscribers.lock().await;
            if subscribers.is_empty() {
                debug!("no active WebSocket subscribers to broadcast anomaly to");
                return;
            }
            subscribers.keys().copied().collect()
        };

        let sends = ids.into_iter().map(|id| {
            let payload = payload.clone();
            async move {
                let sent = {
                    let subscribers = self.subscribers.lock().await;
                    match subscribers.get(&id) {
                        Some(sender) => {
                            let mut sender = sender.lock().await;
                            sender.send(Message::Text(payload)).await.is_ok()
                        }
                        None => true, // already removed concurrently
                    }
                };
                (id, sent)
            }
        });
        let results = future::join_all(sends).await;

        let mut failed = Vec::new();
        for (id, sent) in results {
            if sent {
                counter!("air_quality.broadcast.delivered.count", 1);
            } else {
                counter!("air_quality.broadcast.failed.count", 1);
                failed.push(id);
            }
        }

        if !failed.is_empty() {
            let mut subscribers = self.subscribers.lock().await;
            for id in failed {
                subscribers.remove(&id);
            }
        }
        info!("broadcast of anomaly {} finished", anomaly.id);
    }

    async fn send_to(&self, id: u64, text: String) -> bool {
        let subscribers = self.subscribers.lock().await;
        match subscribers.get(&id) {
            Some(sender) => sender.lock().await.send(Message::Text(text)).await.is_ok(),
            None => false,
        }
    }
}

/// Drive one accepted WebSocket connection: send the welcome frame, replay
/// recent anomalies, then pump inbound `ping` frames into `pong` replies
/// until the client disconnects.
pub async fn handle_socket(socket: WebSocket, hub: Arc<WsHub>, recent: Vec<Anomaly>) {
    let (sender, mut receiver) = socket.split();
    let id = hub.connect(sender).await;

    let welcome = ServerFrame::ConnectionStatus {
        status: "connected",
        message: "connected to air quality anomaly feed",
        timestamp: Utc::now(),
    };
    if let Ok(text) = serde_json::to_string(&welcome) {
        hub.send_to(id, text).await;
    }

    for anomaly in &recent {
        let frame = ServerFrame::RecentAnomaly { payload: anomaly };
        if let Ok(text) = serde_json::to_string(&frame) {
            if !hub.send_to(id, text).await {
                break;
            }
        }
    }

    while let Some(Ok(message)) = receiver.next().await {
        match message {
            Message::Text(text) if text == "ping" => {
                let pong = ServerFrame::Pong {
                    timestamp: Utc::now(),
                    message: "pong",
                };
                if let Ok(text) = serde_json::to_string(&pong) {
                    if !hub.send_to(id, text).await {
                        break;
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    hub.disconnect(id).await;
}
